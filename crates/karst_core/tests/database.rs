//! Integration tests for connections, snapshots and change delivery.

use karst_core::{
    CachePolicy, ChangeSet, Config, Connection, ConnectionConfig, CoreError, Database,
    DatabaseEvent, EventSink, HookPlane, RowKey, Value,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

fn create_database() -> Database {
    Database::open_in_memory().unwrap()
}

fn put_book(connection: &Connection, key: &str, author: &str) {
    connection
        .read_write(|txn| txn.put("books", key, Value::from(author)))
        .unwrap();
}

fn get_author(connection: &Connection, key: &str) -> Option<String> {
    connection
        .read(|txn| {
            txn.get("books", key)
                .and_then(|value| value.as_text().map(str::to_owned))
        })
        .unwrap()
}

/// Records every modified notification it receives.
#[derive(Default)]
struct RecordingSink {
    sets: Mutex<Vec<Arc<ChangeSet>>>,
}

impl EventSink for RecordingSink {
    fn database_modified(&self, changes: &Arc<ChangeSet>) {
        self.sets.lock().push(Arc::clone(changes));
    }
}

impl RecordingSink {
    fn snapshots(&self) -> Vec<u64> {
        self.sets
            .lock()
            .iter()
            .map(|changes| changes.snapshot().value())
            .collect()
    }
}

#[test]
fn snapshot_advances_once_per_modifying_commit() {
    let database = create_database();
    let connection = database.new_connection().unwrap();

    connection
        .read_write(|txn| {
            txn.put("books", "dune", Value::from("herbert"))?;
            txn.put("books", "emma", Value::from("austen"))?;
            txn.put_with_metadata(
                "books",
                "ubik",
                Value::from("dick"),
                Value::from("paperback"),
            )
        })
        .unwrap();
    assert_eq!(database.snapshot().value(), 1);

    put_book(&connection, "solaris", "lem");
    assert_eq!(database.snapshot().value(), 2);

    // Read-only work never advances the snapshot
    connection.read(|txn| txn.row_count("books")).unwrap();
    assert_eq!(database.snapshot().value(), 2);
}

#[test]
fn a_running_read_keeps_its_snapshot() {
    let database = create_database();
    let reader = database.new_connection().unwrap();
    let writer = database.new_connection().unwrap();

    let (start_write, write_requested) = mpsc::channel::<()>();
    let (write_done, committed) = mpsc::channel::<()>();

    let handle = thread::spawn(move || {
        write_requested.recv().unwrap();
        put_book(&writer, "dune", "herbert");
        write_done.send(()).unwrap();
    });

    reader
        .read(|txn| {
            assert_eq!(txn.get("books", "dune"), None);
            start_write.send(()).unwrap();
            committed.recv().unwrap();
            // The commit has landed, but this transaction still reads
            // at the snapshot it started on
            assert_eq!(txn.get("books", "dune"), None);
        })
        .unwrap();
    handle.join().unwrap();

    // The next transaction observes the newer snapshot
    assert_eq!(get_author(&reader, "dune").as_deref(), Some("herbert"));
}

#[test]
fn commits_propagate_to_other_connections() {
    let database = create_database();
    let first = database.new_connection().unwrap();
    let second = database.new_connection().unwrap();

    put_book(&first, "dune", "herbert");

    assert_eq!(get_author(&second, "dune").as_deref(), Some("herbert"));
    assert_eq!(second.snapshot().value(), 1);
}

#[test]
fn writers_are_mutually_exclusive() {
    let database = create_database();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for worker in 0..4 {
        let connection = database.new_connection().unwrap();
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        handles.push(thread::spawn(move || {
            connection
                .read_write(|txn| {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    running.fetch_sub(1, Ordering::SeqCst);
                    txn.put("counters", &format!("w{worker}"), Value::from(worker))
                })
                .unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(database.snapshot().value(), 4);
}

#[test]
fn reserved_collections_reject_user_writes() {
    let database = create_database();
    let connection = database.new_connection().unwrap();

    let system = connection.read_write(|txn| txn.put("sys:registry", "x", Value::Null));
    assert!(matches!(
        system,
        Err(CoreError::ReservedCollection { .. })
    ));

    let extension = connection.read_write(|txn| txn.put("ext:idx:by", "x", Value::Null));
    assert!(matches!(
        extension,
        Err(CoreError::ReservedCollection { .. })
    ));

    // Failed attempts stage nothing
    assert_eq!(database.snapshot().value(), 0);
}

#[test]
fn transactions_do_not_nest_on_one_connection() {
    let database = create_database();
    let connection = database.new_connection().unwrap();

    connection
        .read_write(|_txn| {
            let nested = connection.read(|txn| txn.row_count("books"));
            assert!(matches!(nested, Err(CoreError::Reentrant { .. })));
            Ok(())
        })
        .unwrap();
}

#[test]
fn nested_writes_across_connections_are_rejected() {
    let database = create_database();
    let outer = database.new_connection().unwrap();
    let inner = database.new_connection().unwrap();

    outer
        .read_write(|_txn| {
            let nested = inner.read_write(|txn| txn.put("books", "dune", Value::Null));
            assert!(matches!(nested, Err(CoreError::NestedWrite)));
            Ok(())
        })
        .unwrap();
}

#[test]
fn writes_to_a_different_database_nest_fine() {
    let first = create_database();
    let second = create_database();
    let outer = first.new_connection().unwrap();
    let inner = second.new_connection().unwrap();

    outer
        .read_write(|txn| {
            txn.put("books", "dune", Value::from("herbert"))?;
            inner.read_write(|txn| txn.put("books", "emma", Value::from("austen")))
        })
        .unwrap();

    assert_eq!(first.snapshot().value(), 1);
    assert_eq!(second.snapshot().value(), 1);
}

#[test]
fn pinned_connections_freeze_their_view() {
    let database = create_database();
    let pinned = database.new_connection().unwrap();
    let writer = database.new_connection().unwrap();

    put_book(&writer, "dune", "herbert");
    assert_eq!(get_author(&pinned, "dune").as_deref(), Some("herbert"));

    // Already caught up, so nothing needed applying
    assert!(pinned.pin_snapshot().unwrap().is_empty());
    assert_eq!(pinned.pinned_snapshot().map(|s| s.value()), Some(1));

    put_book(&writer, "emma", "austen");
    put_book(&writer, "ubik", "dick");
    assert_eq!(database.snapshot().value(), 3);

    // The pinned view has not moved
    assert_eq!(pinned.snapshot().value(), 1);
    assert_eq!(get_author(&pinned, "emma"), None);

    // Writing through a pinned connection is refused
    let write = pinned.read_write(|txn| txn.put("books", "x", Value::Null));
    assert!(matches!(write, Err(CoreError::WritePinned { .. })));

    pinned.unpin_snapshot().unwrap();
    assert_eq!(pinned.pinned_snapshot(), None);
    assert_eq!(pinned.snapshot().value(), 3);
    assert_eq!(get_author(&pinned, "emma").as_deref(), Some("austen"));
    assert_eq!(get_author(&pinned, "ubik").as_deref(), Some("dick"));
}

#[test]
fn repinning_jumps_to_the_newest_snapshot() {
    let database = create_database();
    let pinned = database.new_connection().unwrap();
    let writer = database.new_connection().unwrap();

    put_book(&writer, "dune", "herbert");
    assert!(pinned.pin_snapshot().unwrap().is_empty());
    assert_eq!(pinned.snapshot().value(), 1);

    put_book(&writer, "emma", "austen");
    put_book(&writer, "ubik", "dick");
    assert_eq!(get_author(&pinned, "emma"), None);

    // The second pin replays what was journaled in the meantime and
    // freezes at the new tip
    let applied = pinned.pin_snapshot().unwrap();
    let snapshots: Vec<u64> = applied.iter().map(|set| set.snapshot().value()).collect();
    assert_eq!(snapshots, vec![2, 3]);
    assert_eq!(pinned.pinned_snapshot().map(|s| s.value()), Some(3));
    assert_eq!(get_author(&pinned, "emma").as_deref(), Some("austen"));

    // Still pinned: later commits stay invisible
    put_book(&writer, "vurt", "noon");
    assert_eq!(get_author(&pinned, "vurt"), None);

    pinned.unpin_snapshot().unwrap();
    assert_eq!(get_author(&pinned, "vurt").as_deref(), Some("noon"));
}

#[test]
fn unpinning_without_a_pin_is_a_no_op() {
    let database = create_database();
    let connection = database.new_connection().unwrap();
    connection.unpin_snapshot().unwrap();
    assert_eq!(connection.pinned_snapshot(), None);
}

#[test]
fn flush_drains_queued_asynchronous_work() {
    let database = create_database();
    let connection = database.new_connection().unwrap();

    connection.read_write_async(|txn| txn.put("books", "dune", Value::from("herbert")));
    connection.read_write_async(|txn| txn.put("books", "emma", Value::from("austen")));
    connection.flush().unwrap();

    assert_eq!(database.snapshot().value(), 2);
    assert_eq!(get_author(&connection, "dune").as_deref(), Some("herbert"));
    assert_eq!(get_author(&connection, "emma").as_deref(), Some("austen"));
}

#[test]
fn asynchronous_submissions_run_in_order() {
    let database = create_database();
    let connection = database.new_connection().unwrap();
    let (sender, receiver) = mpsc::channel();

    connection.read_write_async(|txn| txn.put("books", "dune", Value::from("herbert")));
    connection.read_async(move |txn| {
        let author = txn
            .get("books", "dune")
            .and_then(|value| value.as_text().map(str::to_owned));
        sender.send(author).unwrap();
    });

    let seen = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(seen.as_deref(), Some("herbert"));
}

#[test]
fn asynchronous_writes_report_their_outcome() {
    let database = create_database();
    let connection = database.new_connection().unwrap();
    let (sender, receiver) = mpsc::channel();

    let report = sender.clone();
    connection.read_write_async_with(
        |txn| txn.put("books", "dune", Value::from("herbert")),
        move |result| report.send(result).unwrap(),
    );
    connection.read_write_async_with(
        |txn| txn.put("sys:registry", "x", Value::Null),
        move |result| sender.send(result).unwrap(),
    );

    let first = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(first.is_ok());
    let second = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(second, Err(CoreError::ReservedCollection { .. })));

    // The failed write left nothing behind
    assert_eq!(database.snapshot().value(), 1);
    assert_eq!(get_author(&connection, "dune").as_deref(), Some("herbert"));
}

#[test]
fn sinks_hear_each_commit_once_in_snapshot_order() {
    let database = create_database();
    let sink = Arc::new(RecordingSink::default());
    database.add_event_sink(Arc::clone(&sink) as Arc<dyn EventSink>);

    let first = database.new_connection().unwrap();
    let second = database.new_connection().unwrap();

    put_book(&first, "dune", "herbert");
    put_book(&second, "emma", "austen");
    // Force both connections to confirm everything they have received
    first.read(|_txn| ()).unwrap();
    second.read(|_txn| ()).unwrap();

    assert_eq!(sink.snapshots(), vec![1, 2]);
}

#[test]
fn channel_subscribers_receive_commit_events() {
    let database = create_database();
    let events = database.subscribe();
    let connection = database.new_connection().unwrap();

    put_book(&connection, "dune", "herbert");

    match events.recv_timeout(Duration::from_secs(5)).unwrap() {
        DatabaseEvent::Modified(changes) => {
            assert_eq!(changes.snapshot().value(), 1);
            assert_eq!(changes.origin(), connection.id());
            assert!(changes.affects("books", "dune"));
        }
        DatabaseEvent::Closed(_) => panic!("expected a modified event"),
    }
}

#[test]
fn custom_tags_ride_the_change_set() {
    let database = create_database();
    let sink = Arc::new(RecordingSink::default());
    database.add_event_sink(Arc::clone(&sink) as Arc<dyn EventSink>);
    let connection = database.new_connection().unwrap();

    connection
        .read_write(|txn| {
            txn.put("books", "dune", Value::from("herbert"))?;
            txn.set_custom_tag(Arc::new("import-batch-7".to_string()));
            Ok(())
        })
        .unwrap();

    let sets = sink.sets.lock();
    let tag = sets[0]
        .custom_tag()
        .and_then(|tag| tag.downcast_ref::<String>())
        .cloned();
    assert_eq!(tag.as_deref(), Some("import-batch-7"));
}

#[test]
fn change_sets_split_inserts_from_updates_and_removals() {
    let database = create_database();
    let sink = Arc::new(RecordingSink::default());
    database.add_event_sink(Arc::clone(&sink) as Arc<dyn EventSink>);
    let connection = database.new_connection().unwrap();

    connection
        .read_write(|txn| {
            txn.put("books", "dune", Value::from("herbert"))?;
            txn.put("books", "gone", Value::from("nobody"))
        })
        .unwrap();
    connection
        .read_write(|txn| {
            txn.put("books", "dune", Value::from("frank herbert"))?;
            txn.put("books", "emma", Value::from("austen"))?;
            txn.remove("books", "gone")
        })
        .unwrap();

    let sets = sink.sets.lock();
    let first: Vec<&RowKey> = sets[0].inserted_keys().collect();
    assert_eq!(
        first,
        vec![&RowKey::new("books", "dune"), &RowKey::new("books", "gone")]
    );

    // Overwriting dune is not an insert; only emma is new
    let second: Vec<&RowKey> = sets[1].inserted_keys().collect();
    assert_eq!(second, vec![&RowKey::new("books", "emma")]);
    let removed: Vec<&RowKey> = sets[1].removed_keys().collect();
    assert_eq!(removed, vec![&RowKey::new("books", "gone")]);
}

#[test]
fn identity_caches_adopt_the_committed_value() {
    let database = create_database();
    let sink = Arc::new(RecordingSink::default());
    database.add_event_sink(Arc::clone(&sink) as Arc<dyn EventSink>);

    let writer = database.new_connection().unwrap();
    let config = ConnectionConfig::default().with_object_policy(CachePolicy::Identity);
    let observer = database.new_connection_with_config(config).unwrap();

    // A prior miss leaves a negative entry; identity overwrites it
    assert_eq!(get_author(&observer, "dune"), None);

    put_book(&writer, "dune", "herbert");
    put_book(&writer, "emma", "austen");

    let dune = observer.read(|txn| txn.get("books", "dune")).unwrap().unwrap();
    // Never read before, adopted straight from the change set
    let emma = observer.read(|txn| txn.get("books", "emma")).unwrap().unwrap();

    let sets = sink.sets.lock();
    let committed = |index: usize, key: &str| {
        match sets[index].object_change(&RowKey::new("books", key)) {
            Some(karst_core::RowChange::Updated(value)) => Arc::clone(value),
            other => panic!("unexpected change: {other:?}"),
        }
    };
    assert!(Arc::ptr_eq(&dune, &committed(0, "dune")));
    assert!(Arc::ptr_eq(&emma, &committed(1, "emma")));
}

#[test]
fn rows_that_fail_to_decode_read_as_absent() {
    let database = create_database();
    database.set_serializer(
        Some("raw"),
        HookPlane::Object,
        Arc::new(|_collection, _key, _value: &Value| Ok(vec![0xff, 0xff])),
    );

    let writer = database.new_connection().unwrap();
    let reader = database.new_connection().unwrap();

    writer
        .read_write(|txn| txn.put("raw", "bad", Value::from("fine at write time")))
        .unwrap();

    // The writer's cache still holds the pre-serialization value; a
    // connection that must hit storage sees the poisoned bytes and
    // reports the row as absent instead of failing the read
    let seen = reader.read(|txn| txn.get("raw", "bad")).unwrap();
    assert_eq!(seen, None);
}

#[test]
fn connection_defaults_flow_into_new_connections() {
    let defaults = ConnectionConfig::default().with_object_cache_enabled(false);
    let config = Config::default().with_connection_defaults(defaults);
    let database = Database::open_in_memory_with_config(config).unwrap();
    database.set_serializer(
        Some("raw"),
        HookPlane::Object,
        Arc::new(|_collection, _key, _value: &Value| Ok(vec![0xff, 0xff])),
    );

    // With an object cache this read would be served from memory. The
    // inherited disabled cache forces storage, where the poisoned
    // bytes decode as absent.
    let plain = database.new_connection().unwrap();
    plain
        .read_write(|txn| txn.put("raw", "bad", Value::from("fine at write time")))
        .unwrap();
    assert_eq!(plain.read(|txn| txn.get("raw", "bad")).unwrap(), None);

    // An explicit per-connection config still wins over the defaults
    let tuned = database
        .new_connection_with_config(ConnectionConfig::default())
        .unwrap();
    tuned
        .read_write(|txn| txn.put("raw", "kept", Value::from("still cached")))
        .unwrap();
    let seen = tuned
        .read(|txn| {
            txn.get("raw", "kept")
                .and_then(|value| value.as_text().map(str::to_owned))
        })
        .unwrap();
    assert_eq!(seen.as_deref(), Some("still cached"));
}

#[test]
fn remove_collection_and_remove_all_are_observed_everywhere() {
    let database = create_database();
    let first = database.new_connection().unwrap();
    let second = database.new_connection().unwrap();

    put_book(&first, "dune", "herbert");
    first
        .read_write(|txn| txn.put("tasks", "t1", Value::from("write tests")))
        .unwrap();
    assert_eq!(get_author(&second, "dune").as_deref(), Some("herbert"));

    first.read_write(|txn| txn.remove_collection("books")).unwrap();
    assert_eq!(get_author(&second, "dune"), None);
    assert_eq!(second.read(|txn| txn.row_count("tasks")).unwrap(), 1);

    first.read_write(|txn| txn.remove_all()).unwrap();
    assert_eq!(second.read(|txn| txn.collections()).unwrap(), Vec::<String>::new());
}

#[test]
fn snapshot_accessors_track_the_connection() {
    let database = create_database();
    let connection = database.new_connection().unwrap();
    assert_eq!(connection.snapshot().value(), 0);

    put_book(&connection, "dune", "herbert");
    assert_eq!(connection.snapshot().value(), 1);

    let late = database.new_connection().unwrap();
    // New connections start at the current tip
    assert_eq!(late.snapshot().value(), 1);
}
