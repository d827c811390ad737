use std::sync::Arc;

use graphorm::config::Connections;
use graphorm::model::{ModelBuilder, RegistryBuilder};
use graphorm::property::Property;
use graphorm::query::{DateKind, PlanKind};
use graphorm::transport::MemoryGraph;
use graphorm::{GraphOrmError, QuerySet, Result, Store, Value, Q};
use time::macros::date;

fn setup() -> Store {
    let registry = RegistryBuilder::new()
        .register(
            ModelBuilder::new("tests", "Mouse")
                .property("name", Property::string().indexed())
                .property("age", Property::integer().indexed()),
        )
        .register(
            ModelBuilder::new("tests", "Person")
                .property("name", Property::string().indexed())
                .property("age", Property::integer().indexed())
                .property("born", Property::date().null())
                .property("motto", Property::string().blank().default("")),
        )
        .register(
            ModelBuilder::new("tests", "Animal").property("name", Property::string().indexed()),
        )
        .register(
            ModelBuilder::new("tests", "Dog")
                .parent("tests.Animal")
                .property("breed", Property::string().null()),
        )
        .build()
        .unwrap();
    Store::new(registry, Connections::memory(Arc::new(MemoryGraph::new())))
}

fn names(qs: QuerySet) -> Result<Vec<String>> {
    qs.iter()
        .map(|item| {
            let instance = item?;
            Ok(instance.get("name")?.as_str().unwrap_or_default().to_owned())
        })
        .collect()
}

fn plan_of(qs: &QuerySet) -> Option<PlanKind> {
    let mut iter = qs.iter();
    let _ = iter.next();
    iter.plan_kind()
}

fn people(store: &Store) -> Result<()> {
    let rows = [
        ("Ann", 12, Some(date!(2011 - 08 - 17))),
        ("anton", 18, Some(date!(2005 - 03 - 02))),
        ("Bert", 30, Some(date!(1993 - 08 - 01))),
        ("Cleo", 45, None),
        ("Dora", 70, Some(date!(1953 - 12 - 24))),
    ];
    for (name, age, born) in rows {
        let born = born.map_or(Value::Null, Value::from);
        store.create(
            "tests.Person",
            [("name", Value::from(name)), ("age", Value::from(age)), ("born", born)],
        )?;
    }
    Ok(())
}

#[test]
fn negated_lookup_excludes_only_the_named_mouse() -> Result<()> {
    let store = setup();
    for (name, age) in [("jerry", 2), ("Brain", 3), ("Pinky", 2)] {
        store.create("tests.Mouse", [("name", Value::from(name)), ("age", Value::from(age))])?;
    }
    assert_eq!(store.objects("tests.Mouse").filter("age", 2).count()?, 2);
    let qs = store
        .objects("tests.Mouse")
        .filter_q(Q::new("age", 2) & !Q::new("name", "jerry"));
    assert_eq!(names(qs)?, vec!["Pinky".to_owned()]);

    let qs = store.objects("tests.Mouse").exclude("age", 2);
    assert_eq!(names(qs)?, vec!["Brain".to_owned()]);
    Ok(())
}

#[test]
fn range_lookups_bound_both_ends() -> Result<()> {
    let store = setup();
    people(&store)?;
    let objects = store.objects("tests.Person");
    assert_eq!(objects.clone().filter("age__gt", 18).count()?, 3);
    assert_eq!(objects.clone().filter("age__gte", 18).count()?, 4);
    assert_eq!(objects.clone().filter("age__lt", 18).count()?, 1);
    assert_eq!(objects.clone().filter("age__lte", 18).count()?, 2);
    let between = objects
        .clone()
        .filter("age__range", Value::List(vec![Value::from(18), Value::from(45)]))
        .order_by(&["age"]);
    assert_eq!(
        names(between)?,
        vec!["anton".to_owned(), "Bert".to_owned(), "Cleo".to_owned()]
    );
    Ok(())
}

#[test]
fn people_ages_and_prefixes() -> Result<()> {
    let store = setup();
    let rows = [("Pete", 5), ("John", 10), ("peter", 15), ("Ann", 15), ("Bo", 30)];
    for (name, age) in rows {
        store.create("tests.Person", [("name", Value::from(name)), ("age", Value::from(age))])?;
    }
    let objects = store.objects("tests.Person");
    assert_eq!(objects.clone().filter("age__gt", 13).count()?, 3);
    let teens = Value::List(vec![Value::from(10), Value::from(20)]);
    assert_eq!(objects.clone().filter("age__range", teens).count()?, 3);
    assert_eq!(objects.clone().filter("name__istartswith", "pete").count()?, 2);
    Ok(())
}

#[test]
fn string_lookups() -> Result<()> {
    let store = setup();
    people(&store)?;
    let objects = store.objects("tests.Person");
    let an = objects.clone().filter("name__istartswith", "an").order_by(&["age"]);
    assert_eq!(names(an)?, vec!["Ann".to_owned(), "anton".to_owned()]);
    assert_eq!(objects.clone().filter("name__startswith", "an").count()?, 1);
    assert_eq!(objects.clone().filter("name__contains", "er").count()?, 1);
    assert_eq!(objects.clone().filter("name__iexact", "DORA").count()?, 1);
    assert_eq!(
        objects
            .clone()
            .filter("name__in", Value::List(vec!["Ann".into(), "Cleo".into(), "Zed".into()]))
            .count()?,
        2
    );
    Ok(())
}

#[test]
fn date_parts_and_null_checks() -> Result<()> {
    let store = setup();
    people(&store)?;
    let objects = store.objects("tests.Person");
    assert_eq!(objects.clone().filter("born__month", 8).count()?, 2);
    assert_eq!(objects.clone().filter("born__year", 2005).count()?, 1);
    assert_eq!(objects.clone().filter("born__isnull", true).count()?, 1);
    assert_eq!(objects.clone().filter("born__isnull", false).count()?, 4);

    let months = objects.dates("born", DateKind::Month)?;
    assert_eq!(
        months,
        vec![
            Value::Date(date!(1953 - 12 - 01)),
            Value::Date(date!(1993 - 08 - 01)),
            Value::Date(date!(2005 - 03 - 01)),
            Value::Date(date!(2011 - 08 - 01)),
        ]
    );
    Ok(())
}

#[test]
fn ordering_and_windows() -> Result<()> {
    let store = setup();
    people(&store)?;
    let oldest_first = store.objects("tests.Person").order_by(&["-age"]);
    assert_eq!(
        names(oldest_first.clone().slice(1..3))?,
        vec!["Cleo".to_owned(), "Bert".to_owned()]
    );
    assert_eq!(oldest_first.clone().slice(1..3).count()?, 2);
    assert_eq!(oldest_first.clone().slice(1..3).slice(1..5).count()?, 1);
    let first = oldest_first.first()?.unwrap();
    assert_eq!(first.get("name")?, Value::from("Dora"));

    let err = store.objects("tests.Person").order_by(&["height"]).all().unwrap_err();
    assert!(matches!(err, GraphOrmError::Field(_)));
    Ok(())
}

#[test]
fn plans_follow_the_conditions() -> Result<()> {
    let store = setup();
    people(&store)?;
    let objects = store.objects("tests.Person");
    let ann = objects.get_by("name", "Ann")?;

    assert_eq!(plan_of(&objects), Some(PlanKind::Traversal));
    assert_eq!(plan_of(&objects.clone().filter("age", 12)), Some(PlanKind::Index));
    let by_id = objects.clone().filter("id", Value::from(ann.pk()?));
    assert_eq!(plan_of(&by_id), Some(PlanKind::Ids));
    assert_eq!(by_id.get()?, ann);
    let contradiction = objects.clone().filter("age__in", Value::List(Vec::new()));
    assert_eq!(plan_of(&contradiction), Some(PlanKind::Empty));
    assert_eq!(contradiction.count()?, 0);
    let everyone = objects.clone().exclude("age__in", Value::List(Vec::new()));
    assert_eq!(everyone.count()?, 5);
    Ok(())
}

#[test]
fn get_reports_missing_and_multiple() -> Result<()> {
    let store = setup();
    people(&store)?;
    let objects = store.objects("tests.Person");
    let err = objects.clone().filter("age__gt", 20).get().unwrap_err();
    assert!(matches!(err, GraphOrmError::MultipleObjects { count: 3, .. }));
    let err = objects.get_by("name", "Nobody").unwrap_err();
    assert!(matches!(err, GraphOrmError::DoesNotExist(_)));
    let err = objects.clone().filter("name__soundslike", "x").count().unwrap_err();
    assert!(matches!(err, GraphOrmError::NotImplemented(_)));
    Ok(())
}

#[test]
fn aggregates_and_latest() -> Result<()> {
    let store = setup();
    people(&store)?;
    let objects = store.objects("tests.Person");
    let stats = objects.aggregate(&["age__min", "age__max", "age__sum", "born__count"])?;
    assert_eq!(stats["age__min"], Value::Int(12));
    assert_eq!(stats["age__max"], Value::Int(70));
    assert_eq!(stats["age__sum"], Value::Int(175));
    assert_eq!(stats["born__count"], Value::Int(4));
    assert_eq!(objects.latest("born")?.get("name")?, Value::from("Ann"));
    Ok(())
}

#[test]
fn bulk_update_rewrites_index_entries() -> Result<()> {
    let store = setup();
    people(&store)?;
    let objects = store.objects("tests.Person");
    let updated = objects.clone().filter("age__lt", 20).update([("age", Value::from(21))])?;
    assert_eq!(updated, 2);
    assert_eq!(objects.clone().filter("age", 21).count()?, 2);
    assert_eq!(objects.clone().filter("age__lt", 20).count()?, 0);

    let updated = objects.clone().filter("name", "Cleo").update([("motto", Value::from("carpe"))])?;
    assert_eq!(updated, 1);
    assert_eq!(objects.get_by("name", "Cleo")?.get("motto")?, Value::from("carpe"));
    Ok(())
}

#[test]
fn get_or_create_only_creates_once() -> Result<()> {
    let store = setup();
    let objects = store.objects("tests.Mouse");
    let (first, created) = objects.get_or_create([("name", Value::from("jerry")), ("age", Value::from(1))])?;
    assert!(created);
    let (second, created) = objects.get_or_create([("name", Value::from("jerry")), ("age", Value::from(1))])?;
    assert!(!created);
    assert_eq!(first, second);
    assert_eq!(objects.count()?, 1);
    Ok(())
}

#[test]
fn parent_queries_include_subtypes() -> Result<()> {
    let store = setup();
    store.create("tests.Animal", [("name", Value::from("generic"))])?;
    store.create("tests.Dog", [("name", Value::from("rex")), ("breed", Value::from("pug"))])?;
    assert_eq!(store.objects("tests.Animal").count()?, 2);
    assert_eq!(store.objects("tests.Dog").count()?, 1);
    let rex = store.objects("tests.Animal").get_by("name", "rex")?;
    assert_eq!(rex.model().type_name(), "tests.Dog");
    assert_eq!(rex.get("breed")?, Value::from("pug"));
    assert_eq!(store.objects("tests.Dog").filter("name", "generic").count()?, 0);
    Ok(())
}
