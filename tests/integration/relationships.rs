use std::sync::Arc;

use graphorm::config::Connections;
use graphorm::model::{ModelBuilder, RegistryBuilder, Relationship};
use graphorm::property::Property;
use graphorm::transport::MemoryGraph;
use graphorm::{GraphOrmError, Instance, Result, Store, Value};

fn setup() -> (Store, Arc<MemoryGraph>) {
    let registry = RegistryBuilder::new()
        .register(ModelBuilder::new("tests", "Actor").property("name", Property::string().indexed()))
        .register(
            ModelBuilder::new("tests", "MovieCredits")
                .property("title", Property::string().indexed())
                .relationship(
                    "actors",
                    Relationship::to("tests.Actor", "acted_in").ordered().related_name("credits"),
                ),
        )
        .register(ModelBuilder::new("tests", "Person").property("name", Property::string().indexed()))
        .register(
            ModelBuilder::new("tests", "Pet")
                .property("name", Property::string().indexed())
                .relationship(
                    "owner",
                    Relationship::to("tests.Person", "owned_by").single().related_name("pets"),
                ),
        )
        .build()
        .unwrap();
    let graph = Arc::new(MemoryGraph::new());
    let store = Store::new(registry, Connections::memory(Arc::clone(&graph)));
    (store, graph)
}

fn names(instances: &[Instance], field: &str) -> Result<Vec<String>> {
    instances
        .iter()
        .map(|instance| Ok(instance.get(field)?.as_str().unwrap_or_default().to_owned()))
        .collect()
}

#[test]
fn ordered_credits_survive_removal_and_reload() -> Result<()> {
    let (store, _graph) = setup();
    let cast: Vec<Instance> = ["A", "B", "C", "D"]
        .into_iter()
        .map(|name| store.create("tests.Actor", [("name", Value::from(name))]))
        .collect::<Result<_>>()?;
    let movie = store.instance("tests.MovieCredits")?;
    movie.set("title", "Heat")?;
    let actors = movie.related("actors")?;
    actors.add(&cast.iter().collect::<Vec<_>>())?;
    movie.save()?;

    actors.remove(&[&cast[1]])?;
    movie.save()?;

    let reloaded = store.objects("tests.MovieCredits").get_by("title", "Heat")?;
    let credits = reloaded.related("actors")?.all()?;
    assert_eq!(names(&credits, "name")?, vec!["A", "C", "D"]);
    assert_eq!(reloaded.related("actors")?.slice(1..3)?.len(), 2);
    Ok(())
}

#[test]
fn reverse_side_sees_saved_edges() -> Result<()> {
    let (store, _graph) = setup();
    let actor = store.create("tests.Actor", [("name", Value::from("Pacino"))])?;
    let movie = store.instance("tests.MovieCredits")?;
    movie.set("title", "Heat")?;
    movie.related("actors")?.add(&[&actor])?;
    movie.save()?;

    let fresh = store.objects("tests.Actor").get_by("name", "Pacino")?;
    let credits = fresh.related("credits")?.all()?;
    assert_eq!(names(&credits, "title")?, vec!["Heat"]);
    assert_eq!(actor.related("credits")?.count()?, 1);
    Ok(())
}

#[test]
fn single_relationship_replaces_its_target() -> Result<()> {
    let (store, graph) = setup();
    let ann = store.create("tests.Person", [("name", Value::from("Ann"))])?;
    let bob = store.create("tests.Person", [("name", Value::from("Bob"))])?;
    let rex = store.instance("tests.Pet")?;
    rex.set("name", "Rex")?;
    rex.set_single("owner", Some(&ann))?;
    rex.save()?;
    let edges = graph.edge_count();

    rex.set_single("owner", Some(&bob))?;
    rex.save()?;
    assert_eq!(graph.edge_count(), edges);

    let fresh = store.objects("tests.Pet").get_by("name", "Rex")?;
    assert_eq!(fresh.single("owner")?, Some(bob.clone()));
    let bob = store.objects("tests.Person").get_by("name", "Bob")?;
    assert_eq!(bob.related("pets")?.count()?, 1);
    let ann = store.objects("tests.Person").get_by("name", "Ann")?;
    assert_eq!(ann.related("pets")?.count()?, 0);

    assert!(matches!(fresh.related("owner"), Err(GraphOrmError::Validation(_))));
    Ok(())
}

#[test]
fn related_managers_query_and_create() -> Result<()> {
    let (store, _graph) = setup();
    let ann = store.create("tests.Person", [("name", Value::from("Ann"))])?;
    let rex = ann.related("pets")?.create([("name", Value::from("Rex"))])?;
    ann.related("pets")?.create([("name", Value::from("Tom"))])?;
    store.create("tests.Pet", [("name", Value::from("Stray"))])?;
    let bob = store.create("tests.Person", [("name", Value::from("Bob"))])?;
    bob.related("pets")?.create([("name", Value::from("Fido"))])?;

    assert!(rex.is_saved());
    let pets = ann.related("pets")?;
    assert_eq!(pets.query()?.count()?, 2);
    assert_eq!(pets.filter("name", "Tom")?.count()?, 1);
    assert_eq!(pets.filter("name", "Stray")?.count()?, 0);

    let by_owner = store.objects("tests.Pet").filter("owner__name", "Ann");
    assert_eq!(by_owner.count()?, 2);
    // Negated related lookups still require the path to exist.
    let others = store.objects("tests.Pet").exclude("owner__name", "Ann");
    assert_eq!(others.get()?.get("name")?, Value::from("Fido"));
    Ok(())
}

#[test]
fn wrong_target_model_is_rejected() -> Result<()> {
    let (store, _graph) = setup();
    let movie = store.create("tests.MovieCredits", [("title", Value::from("Heat"))])?;
    let person = store.create("tests.Person", [("name", Value::from("Ann"))])?;
    let err = movie.related("actors")?.add(&[&person]).unwrap_err();
    assert!(matches!(err, GraphOrmError::Validation(_)));
    Ok(())
}

#[test]
fn deleting_a_target_drops_it_from_loaded_caches() -> Result<()> {
    let (store, _graph) = setup();
    let movie = store.create("tests.MovieCredits", [("title", Value::from("Heat"))])?;
    let a = store.create("tests.Actor", [("name", Value::from("A"))])?;
    let b = store.create("tests.Actor", [("name", Value::from("B"))])?;
    let actors = movie.related("actors")?;
    actors.add(&[&a, &b])?;
    movie.save()?;
    assert_eq!(actors.count()?, 2);

    a.delete()?;
    assert_eq!(names(&actors.all()?, "name")?, vec!["B"]);
    Ok(())
}
