use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use graphorm::config::{ClientKind, Connections, Settings};
use graphorm::model::{ModelBuilder, RegistryBuilder};
use graphorm::property::Property;
use graphorm::transport::MemoryGraph;
use graphorm::{GraphOrmError, Result, Signal, Store, Value};
use tempfile::NamedTempFile;

fn setup() -> (Store, Arc<MemoryGraph>) {
    let registry = RegistryBuilder::new()
        .register(
            ModelBuilder::new("tests", "Person")
                .property("name", Property::string().indexed().max_length(40))
                .property("age", Property::integer().indexed().null())
                .property("nickname", Property::string().null().default("none")),
        )
        .register(
            ModelBuilder::new("tests", "Pet")
                .property("name", Property::string().indexed())
                .property("serial", Property::auto()),
        )
        .build()
        .unwrap();
    let graph = Arc::new(MemoryGraph::new());
    let store = Store::new(registry, Connections::memory(Arc::clone(&graph)));
    (store, graph)
}

#[test]
fn person_lifecycle() -> Result<()> {
    let (store, _graph) = setup();
    let pete = store.create("tests.Person", [("name", Value::from("Pete")), ("age", Value::from(30))])?;
    assert!(pete.is_saved());
    let id = pete.pk()?;
    assert!(id.0 > 0);
    assert_eq!(pete.get("nickname")?, Value::from("none"));

    let fetched = store.objects("tests.Person").get_by("name", "Pete")?;
    assert_eq!(fetched, pete);
    assert_eq!(fetched.get("age")?, Value::Int(30));

    fetched.set("age", 31)?;
    fetched.save()?;
    assert_eq!(store.objects("tests.Person").filter("age", 31).count()?, 1);
    assert_eq!(store.objects("tests.Person").filter("age", 30).count()?, 0);

    fetched.delete()?;
    assert!(!fetched.is_saved());
    assert_eq!(store.objects("tests.Person").count()?, 0);
    let missing = store.objects("tests.Person").get_by("id", id);
    assert!(matches!(missing, Err(GraphOrmError::DoesNotExist(_))));
    Ok(())
}

#[test]
fn saving_unchanged_instance_writes_nothing_new() -> Result<()> {
    let (store, graph) = setup();
    let ann = store.create("tests.Person", [("name", Value::from("Ann"))])?;
    let index = ann.model().index_name();
    let nodes = graph.node_count();
    let entries = graph.index_entry_count(&index);
    ann.save()?;
    ann.save()?;
    assert_eq!(graph.node_count(), nodes);
    assert_eq!(graph.index_entry_count(&index), entries);
    assert!(ann.dirty_fields().is_empty());
    Ok(())
}

#[test]
fn models_do_not_see_each_other() -> Result<()> {
    let (store, _graph) = setup();
    store.create("tests.Person", [("name", Value::from("Rex"))])?;
    store.create("tests.Pet", [("name", Value::from("Rex"))])?;
    assert_eq!(store.objects("tests.Person").filter("name", "Rex").count()?, 1);
    assert_eq!(store.objects("tests.Pet").filter("name", "Rex").count()?, 1);
    let pet = store.objects("tests.Pet").get_by("name", "Rex")?;
    assert_eq!(pet.model().type_name(), "tests.Pet");
    Ok(())
}

#[test]
fn auto_ids_increase_per_model() -> Result<()> {
    let (store, _graph) = setup();
    let mut serials = Vec::new();
    for name in ["a", "b", "c"] {
        let pet = store.create("tests.Pet", [("name", Value::from(name))])?;
        serials.push(pet.get("serial")?.as_int().unwrap());
    }
    assert_eq!(serials, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn invalid_values_are_rejected_before_writing() {
    let (store, graph) = setup();
    let long = "x".repeat(41);
    let err = store
        .create("tests.Person", [("name", Value::from(long.as_str()))])
        .unwrap_err();
    assert!(matches!(err, GraphOrmError::Validation(_)));
    let err = store.create("tests.Person", [("id", Value::from(4))]).unwrap_err();
    assert!(matches!(err, GraphOrmError::Validation(_)));
    let err = store.create("tests.Person", [("shoe_size", Value::from(4))]).unwrap_err();
    assert!(matches!(err, GraphOrmError::Field(_)));
    assert_eq!(graph.node_count(), 0);
}

#[test]
fn signals_fire_around_save_and_delete() -> Result<()> {
    let (store, _graph) = setup();
    let created = Arc::new(AtomicUsize::new(0));
    let deleted = Arc::new(AtomicUsize::new(0));
    {
        let created = Arc::clone(&created);
        let deleted = Arc::clone(&deleted);
        store.signals().connect_for("tests.Person", move |signal| {
            match signal {
                Signal::PostSave { created: true, .. } => {
                    created.fetch_add(1, Ordering::SeqCst);
                }
                Signal::PostDelete { .. } => {
                    deleted.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }
            Ok(())
        });
    }
    let bob = store.create("tests.Person", [("name", Value::from("Bob"))])?;
    bob.set("age", 3)?;
    bob.save()?;
    store.create("tests.Pet", [("name", Value::from("Fido"))])?;
    bob.delete()?;
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(deleted.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn pre_save_handler_can_veto() {
    let (store, graph) = setup();
    store.signals().connect(|signal| match signal {
        Signal::PreSave(instance) if instance.get("name")? == Value::from("Mallory") => {
            Err(GraphOrmError::validation("no Mallory"))
        }
        _ => Ok(()),
    });
    assert!(store.create("tests.Person", [("name", Value::from("Mallory"))]).is_err());
    assert_eq!(graph.node_count(), 0);
}

#[test]
fn settings_load_from_file() -> Result<()> {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
chunk_size = 25

[databases.default]
host = "localhost"
port = 7474

[databases.scratch]
client = "memory"
"#
    )
    .unwrap();
    let settings = Settings::load(Some(file.path()))?;
    assert_eq!(settings.chunk_size, 25);
    assert_eq!(settings.databases["scratch"].client, ClientKind::Memory);
    assert_eq!(settings.databases["default"].endpoint, "/db/data");

    let mut broken = NamedTempFile::new().unwrap();
    writeln!(broken, "[databases.scratch]\nclient = \"memory\"").unwrap();
    let err = Settings::load(Some(broken.path())).unwrap_err();
    assert!(matches!(err, GraphOrmError::Configuration(_)));
    Ok(())
}
