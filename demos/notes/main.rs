//! Notes Application Example
//!
//! This example demonstrates:
//! - Objects with a metadata plane
//! - A value index over one field
//! - Snapshot pinning for a stable view
//! - Commit events

use karst_codec::Value;
use karst_core::{Database, DatabaseEvent, ValueIndex};
use std::time::Duration;

fn note(topic: &str, body: &str, created_at: i64) -> (Value, Value) {
    let object = Value::map(vec![
        (Value::from("topic"), Value::from(topic)),
        (Value::from("body"), Value::from(body)),
    ]);
    let metadata = Value::map(vec![(Value::from("created_at"), Value::from(created_at))]);
    (object, metadata)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("🗄️  karstdb Notes Example\n");

    let dir = tempfile::tempdir()?;
    let database = Database::open(dir.path())?;
    let connection = database.new_connection()?;
    let events = database.subscribe();

    // Look notes up by topic without scanning
    database.register_extension("by-topic", std::sync::Arc::new(ValueIndex::new("notes", "topic")))?;

    // Insert notes
    println!("📥 Inserting notes...");
    connection.read_write(|txn| {
        let entries = [
            ("meeting", note("work", "Discussed the quarter roadmap.", 1_700_000_000)),
            ("pasta", note("cooking", "Boil water, add pasta, ten minutes.", 1_700_001_000)),
            ("chapter", note("writing", "Outline the storage chapter.", 1_700_002_000)),
            ("checklist", note("work", "Setup, implement, test, ship.", 1_700_003_000)),
        ];
        for (key, (object, metadata)) in entries {
            txn.put_with_metadata("notes", key, object, metadata)?;
        }
        Ok(())
    })?;

    // Display all notes with their creation time
    println!("\n📋 All notes:");
    connection.read(|txn| {
        for key in txn.keys("notes") {
            let Some((object, metadata)) = txn.get_row("notes", &key) else {
                continue;
            };
            let topic = object.get("topic").and_then(Value::as_text).unwrap_or("-");
            let created = metadata
                .as_deref()
                .and_then(|m| m.get("created_at"))
                .and_then(Value::as_integer)
                .unwrap_or_default();
            println!("  📄 {key} [{topic}] created at {created}");
        }
    })?;

    // Query through the index
    println!("\n🔍 Notes on 'work':");
    let work = connection.read(|txn| ValueIndex::lookup(txn, "by-topic", &Value::from("work")))??;
    for key in &work {
        println!("  📄 {key}");
    }

    // A pinned connection keeps its view while others write
    let pinned = database.new_connection()?;
    let replayed = pinned.pin_snapshot()?;
    let frozen_at = pinned.pinned_snapshot().unwrap_or_default();
    println!(
        "\n📌 Pinned a connection at snapshot {} ({} change sets folded in)",
        frozen_at.value(),
        replayed.len()
    );

    connection.read_write(|txn| {
        let (object, metadata) = note("work", "Rescheduled the review.", 1_700_004_000);
        txn.put_with_metadata("notes", "review", object, metadata)
    })?;
    let live = connection.read(|txn| txn.row_count("notes"))?;
    let frozen = pinned.read(|txn| txn.row_count("notes"))?;
    println!("  Live connection sees {live} notes, pinned still sees {frozen}");

    pinned.unpin_snapshot()?;
    let caught_up = pinned.read(|txn| txn.row_count("notes"))?;
    println!("  After unpinning it sees {caught_up}");

    // Commit events arrive in snapshot order
    println!("\n📣 Commits observed so far:");
    while let Ok(event) = events.recv_timeout(Duration::from_millis(200)) {
        if let DatabaseEvent::Modified(changes) = event {
            println!(
                "  snapshot {} from {}",
                changes.snapshot().value(),
                changes.origin()
            );
        }
    }

    println!("\n👋 Done, database at {:?}", database.paths().primary);
    Ok(())
}
