use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;

use graphorm::config::Connections;
use graphorm::model::{ModelBuilder, RegistryBuilder};
use graphorm::property::Property;
use graphorm::transport::MemoryGraph;
use graphorm::{GraphOrmError, Result, Store, Value};

const THREADS: usize = 4;
const PER_THREAD: usize = 25;

fn setup() -> (Store, Arc<MemoryGraph>) {
    let registry = RegistryBuilder::new()
        .register(ModelBuilder::new("tests", "UniqueName").property("name", Property::string().indexed().unique()))
        .register(
            ModelBuilder::new("tests", "Ticket")
                .property("number", Property::auto())
                .property("owner", Property::integer()),
        )
        .build()
        .unwrap();
    let graph = Arc::new(MemoryGraph::new());
    let store = Store::new(registry, Connections::memory(Arc::clone(&graph)));
    (store, graph)
}

#[test]
fn second_save_of_a_unique_value_fails() -> Result<()> {
    let (store, _graph) = setup();
    store.create("tests.UniqueName", [("name", Value::from("dup"))])?;
    let err = store
        .create("tests.UniqueName", [("name", Value::from("dup"))])
        .unwrap_err();
    assert!(matches!(err, GraphOrmError::Uniqueness { .. }));
    assert!(err.to_string().contains("<UniqueName>.name"));
    assert_eq!(store.objects("tests.UniqueName").count()?, 1);
    Ok(())
}

#[test]
fn renaming_onto_a_taken_value_fails_and_keeps_the_old_key() -> Result<()> {
    let (store, _graph) = setup();
    store.create("tests.UniqueName", [("name", Value::from("a"))])?;
    let b = store.create("tests.UniqueName", [("name", Value::from("b"))])?;
    b.set("name", "a")?;
    assert!(matches!(b.save(), Err(GraphOrmError::Uniqueness { .. })));
    let objects = store.objects("tests.UniqueName");
    assert_eq!(objects.clone().filter("name", "b").count()?, 1);
    assert_eq!(objects.clone().filter("name", "a").count()?, 1);

    let updated = objects.clone().filter("name", "b").update([("name", Value::from("a"))]);
    assert!(matches!(updated, Err(GraphOrmError::Uniqueness { .. })));
    Ok(())
}

#[test]
fn racing_saves_of_one_unique_value_admit_exactly_one() {
    for round in 0..10 {
        let (store, _graph) = setup();
        let barrier = Barrier::new(THREADS);
        let name = format!("racer-{round}");
        let outcomes: Vec<Result<()>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        store
                            .create("tests.UniqueName", [("name", Value::from(name.as_str()))])
                            .map(|_| ())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let winners = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
        assert_eq!(winners, 1, "round {round}");
        assert!(outcomes
            .iter()
            .filter_map(|outcome| outcome.as_ref().err())
            .all(|err| matches!(err, GraphOrmError::Uniqueness { .. })));
        assert_eq!(store.objects("tests.UniqueName").count().unwrap(), 1);
    }
}

#[test]
fn auto_ids_increase_under_contention() {
    let (store, _graph) = setup();
    let barrier = Barrier::new(THREADS);
    let per_thread: Vec<Vec<i64>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|owner| {
                let store = store.clone();
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    let mut numbers = Vec::with_capacity(PER_THREAD);
                    for _ in 0..PER_THREAD {
                        let ticket = store
                            .create("tests.Ticket", [("owner", Value::from(owner as i64))])
                            .unwrap();
                        numbers.push(ticket.get("number").unwrap().as_int().unwrap());
                    }
                    numbers
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for numbers in &per_thread {
        assert!(numbers.windows(2).all(|pair| pair[0] < pair[1]));
    }
    let all: BTreeSet<i64> = per_thread.iter().flatten().copied().collect();
    let total = (THREADS * PER_THREAD) as i64;
    assert_eq!(all, (1..=total).collect::<BTreeSet<_>>());
}
