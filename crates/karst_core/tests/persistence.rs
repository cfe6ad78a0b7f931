//! Integration tests for the file engine: reopen, locking, lifecycle.

use karst_core::{
    extension_table, CloseEvent, Connection, CoreError, Database, EventSink, StorageError, Value,
    ValueIndex,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tempfile::tempdir;

fn book(author: &str, title: &str) -> Value {
    Value::map(vec![
        (Value::from("author"), Value::from(author)),
        (Value::from("title"), Value::from(title)),
    ])
}

fn authored_by(connection: &Connection, name: &str, author: &str) -> Vec<String> {
    connection
        .read(|txn| ValueIndex::lookup(txn, name, &Value::from(author)))
        .unwrap()
        .unwrap()
}

/// Keeps the close events delivered to it.
#[derive(Default)]
struct CloseSink {
    events: Mutex<Vec<CloseEvent>>,
}

impl EventSink for CloseSink {
    fn database_closed(&self, event: &CloseEvent) {
        self.events.lock().push(event.clone());
    }
}

#[test]
fn data_and_snapshot_survive_reopen() {
    let dir = tempdir().unwrap();

    {
        let database = Database::open(dir.path()).unwrap();
        let connection = database.new_connection().unwrap();
        connection
            .read_write(|txn| {
                txn.put("books", "dune", Value::from("herbert"))?;
                txn.put_with_metadata(
                    "books",
                    "emma",
                    Value::from("austen"),
                    Value::from("hardcover"),
                )
            })
            .unwrap();
        connection
            .read_write(|txn| txn.remove("books", "dune"))
            .unwrap();
        assert_eq!(database.snapshot().value(), 2);
    }

    let database = Database::open(dir.path()).unwrap();
    assert_eq!(database.snapshot().value(), 2);

    let connection = database.new_connection().unwrap();
    assert!(!connection.read(|txn| txn.contains("books", "dune")).unwrap());
    let (object, metadata) = connection
        .read(|txn| txn.get_row("books", "emma"))
        .unwrap()
        .unwrap();
    assert_eq!(object.as_text(), Some("austen"));
    assert_eq!(metadata.as_deref().and_then(Value::as_text), Some("hardcover"));
}

#[test]
fn a_second_database_is_locked_out() {
    let dir = tempdir().unwrap();
    let database = Database::open(dir.path()).unwrap();

    let second = Database::open(dir.path());
    assert!(matches!(
        second,
        Err(CoreError::Storage(StorageError::Locked { .. }))
    ));

    // Dropping the only handle releases the directory
    drop(database);
    Database::open(dir.path()).unwrap();
}

#[test]
fn the_close_event_fires_once_with_the_store_paths() {
    let dir = tempdir().unwrap();
    let sink = Arc::new(CloseSink::default());

    let database = Database::open(dir.path()).unwrap();
    database.add_event_sink(Arc::clone(&sink) as Arc<dyn EventSink>);
    let connection = database.new_connection().unwrap();
    connection
        .read_write(|txn| txn.put("books", "dune", Value::from("herbert")))
        .unwrap();

    // Connections keep the database alive after the handle is gone
    drop(database);
    assert!(sink.events.lock().is_empty());
    assert!(connection.read(|txn| txn.contains("books", "dune")).unwrap());

    drop(connection);
    let events = sink.events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].paths.primary.as_deref(), Some(dir.path()));
    assert!(!events[0].paths.auxiliary.is_empty());
}

#[test]
fn registrations_survive_reopen() {
    let dir = tempdir().unwrap();

    {
        let database = Database::open(dir.path()).unwrap();
        let connection = database.new_connection().unwrap();
        database
            .register_extension("by-author", Arc::new(ValueIndex::new("books", "author")))
            .unwrap();
        connection
            .read_write(|txn| txn.put("books", "dune", book("herbert", "Dune")))
            .unwrap();
    }

    let database = Database::open(dir.path()).unwrap();
    let tip = database.snapshot();

    // The persisted record matches, so the index resumes as is
    let rebuilt = database
        .register_extension("by-author", Arc::new(ValueIndex::new("books", "author")))
        .unwrap();
    assert!(!rebuilt);
    assert_eq!(database.snapshot(), tip);

    let connection = database.new_connection().unwrap();
    assert_eq!(authored_by(&connection, "by-author", "herbert"), vec!["dune"]);

    // And it keeps folding in new commits
    connection
        .read_write(|txn| txn.put("books", "whipping-star", book("herbert", "Whipping Star")))
        .unwrap();
    assert_eq!(
        authored_by(&connection, "by-author", "herbert"),
        vec!["dune", "whipping-star"]
    );
}

#[test]
fn a_changed_config_rebuilds_on_reopen() {
    let dir = tempdir().unwrap();

    {
        let database = Database::open(dir.path()).unwrap();
        let connection = database.new_connection().unwrap();
        database
            .register_extension("by-author", Arc::new(ValueIndex::new("books", "author")))
            .unwrap();
        connection
            .read_write(|txn| txn.put("books", "dune", book("herbert", "Dune")))
            .unwrap();
    }

    let database = Database::open(dir.path()).unwrap();

    // Same name, different indexed field: the persisted record no
    // longer matches, so the old state is dropped and rebuilt
    let rebuilt = database
        .register_extension("by-author", Arc::new(ValueIndex::new("books", "title")))
        .unwrap();
    assert!(rebuilt);

    let connection = database.new_connection().unwrap();
    assert!(authored_by(&connection, "by-author", "herbert").is_empty());
    assert_eq!(authored_by(&connection, "by-author", "Dune"), vec!["dune"]);
}

#[test]
fn orphaned_extension_state_is_swept_on_the_first_mutating_commit() {
    let dir = tempdir().unwrap();

    {
        let database = Database::open(dir.path()).unwrap();
        let connection = database.new_connection().unwrap();
        database
            .register_extension("by-author", Arc::new(ValueIndex::new("books", "author")))
            .unwrap();
        connection
            .read_write(|txn| txn.put("books", "dune", book("herbert", "Dune")))
            .unwrap();
    }

    // Reopened without registering the extension
    let database = Database::open(dir.path()).unwrap();
    let connection = database.new_connection().unwrap();
    let table = extension_table("by-author", "by");

    // The orphaned postings are still on disk
    assert!(connection
        .read(|txn| txn.extension_get(&table, "t:herbert"))
        .unwrap()
        .unwrap()
        .is_some());

    // A commit that changes nothing does not trigger the sweep
    connection.read_write(|_txn| Ok(())).unwrap();
    assert!(connection
        .read(|txn| txn.extension_get(&table, "t:herbert"))
        .unwrap()
        .unwrap()
        .is_some());

    // The first mutating commit removes the record and the tables
    connection
        .read_write(|txn| txn.put("tasks", "t1", Value::from("tidy up")))
        .unwrap();
    assert!(connection
        .read(|txn| txn.extension_get(&table, "t:herbert"))
        .unwrap()
        .unwrap()
        .is_none());

    // With the record gone, registering again is a full build
    assert!(database
        .register_extension("by-author", Arc::new(ValueIndex::new("books", "author")))
        .unwrap());
    assert_eq!(authored_by(&connection, "by-author", "herbert"), vec!["dune"]);
}

#[test]
fn in_memory_databases_report_no_paths() {
    let database = Database::open_in_memory().unwrap();
    assert!(database.paths().primary.is_none());
    assert!(database.paths().auxiliary.is_empty());
}
