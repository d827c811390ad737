use std::collections::BTreeMap;
use std::sync::Arc;

use graphorm::config::Connections;
use graphorm::model::{ModelBuilder, RegistryBuilder, Relationship};
use graphorm::property::Property;
use graphorm::transport::MemoryGraph;
use graphorm::{GraphOrmError, Instance, Result, Store, Value};

const CHAINS: [(&str, &str, &str); 3] = [
    ("spike", "tom", "jerry"),
    ("butch", "sylvester", "speedy"),
    ("droopy", "figaro", "mickey"),
];

fn setup() -> (Store, Arc<MemoryGraph>) {
    let registry = RegistryBuilder::new()
        .register(ModelBuilder::new("tests", "IndexedMouse").property("name", Property::string().indexed()))
        .register(
            ModelBuilder::new("tests", "RelatedCat")
                .property("name", Property::string().indexed())
                .relationship("chases", Relationship::to("tests.IndexedMouse", "chases")),
        )
        .register(
            ModelBuilder::new("tests", "RelatedDog")
                .property("name", Property::string().indexed())
                .relationship("chases", Relationship::to("tests.RelatedCat", "chases")),
        )
        .build()
        .unwrap();
    let graph = Arc::new(MemoryGraph::new());
    let store = Store::new(registry, Connections::memory(Arc::clone(&graph)));
    (store, graph)
}

fn populate(store: &Store) -> Result<()> {
    for (dog, cat, mouse) in CHAINS {
        let mouse = store.create("tests.IndexedMouse", [("name", Value::from(mouse))])?;
        let cat = store.create("tests.RelatedCat", [("name", Value::from(cat))])?;
        cat.related("chases")?.add(&[&mouse])?;
        cat.save()?;
        let dog = store.create("tests.RelatedDog", [("name", Value::from(dog))])?;
        dog.related("chases")?.add(&[&cat])?;
        dog.save()?;
    }
    Ok(())
}

fn name(instance: &Instance) -> Result<String> {
    Ok(instance.get("name")?.as_str().unwrap_or_default().to_owned())
}

fn only(instances: Vec<Instance>) -> Instance {
    assert_eq!(instances.len(), 1);
    instances.into_iter().next().unwrap()
}

#[test]
fn depth_loads_whole_chains_with_one_query() -> Result<()> {
    let (store, graph) = setup();
    populate(&store)?;
    let dogs = store.objects("tests.RelatedDog");

    let before = graph.query_count();
    dogs.all()?;
    let plain = graph.query_count() - before;

    let before = graph.query_count();
    let loaded = dogs.clone().select_related_depth(2).all()?;
    assert_eq!(graph.query_count() - before, plain + 1);

    let requests = graph.request_count();
    let mut seen = BTreeMap::new();
    for dog in &loaded {
        let cat = only(dog.related("chases")?.all()?);
        let mouse = only(cat.related("chases")?.all()?);
        seen.insert(name(dog)?, (name(&cat)?, name(&mouse)?));
    }
    assert_eq!(graph.request_count(), requests);

    let expected: BTreeMap<String, (String, String)> = CHAINS
        .iter()
        .map(|(dog, cat, mouse)| ((*dog).to_owned(), ((*cat).to_owned(), (*mouse).to_owned())))
        .collect();
    assert_eq!(seen, expected);
    Ok(())
}

#[test]
fn named_paths_load_each_hop() -> Result<()> {
    let (store, graph) = setup();
    populate(&store)?;
    let loaded = store
        .objects("tests.RelatedDog")
        .select_related(&["chases__chases"])
        .all()?;
    let requests = graph.request_count();
    for dog in &loaded {
        let cat = only(dog.related("chases")?.all()?);
        let mouse = only(cat.related("chases")?.all()?);
        let expected = CHAINS.iter().find(|(d, _, _)| *d == name(dog).unwrap()).unwrap();
        assert_eq!(name(&cat)?, expected.1);
        assert_eq!(name(&mouse)?, expected.2);
    }
    assert_eq!(graph.request_count(), requests);
    Ok(())
}

#[test]
fn reverse_side_is_filled_too() -> Result<()> {
    let (store, graph) = setup();
    populate(&store)?;
    let cats = store.objects("tests.RelatedCat").select_related(&["chases"]).all()?;
    for cat in &cats {
        let requests = graph.request_count();
        let mouse = only(cat.related("chases")?.all()?);
        assert_eq!(graph.request_count(), requests);
        let chasers = mouse.related("relatedcat_set")?.all()?;
        assert_eq!(chasers, vec![cat.clone()]);
    }
    Ok(())
}

#[test]
fn related_lookup_finds_the_dog_that_chases_jerry() -> Result<()> {
    let (store, _graph) = setup();
    populate(&store)?;
    let dog = store
        .objects("tests.RelatedDog")
        .filter("chases__chases__name", "jerry")
        .get()?;
    assert_eq!(name(&dog)?, "spike");
    let none = store
        .objects("tests.RelatedDog")
        .filter("chases__chases__name", "tom")
        .count()?;
    assert_eq!(none, 0);
    Ok(())
}

#[test]
fn unknown_path_is_a_field_error() -> Result<()> {
    let (store, _graph) = setup();
    populate(&store)?;
    let err = store
        .objects("tests.RelatedDog")
        .select_related(&["chases__befriends"])
        .all()
        .unwrap_err();
    assert!(matches!(err, GraphOrmError::Field(_)));
    Ok(())
}
