//! Storage engine trait definitions.

use crate::error::StorageResult;
use crate::row::{StorePaths, StoredRow};

/// A transactional row store backing one database.
///
/// Engines are **keyed row stores with versioned history**: every commit
/// publishes its staged writes under a snapshot number, and reads at a
/// snapshot observe exactly the rows visible at that point. The engine
/// does not interpret row payloads and knows nothing about caches,
/// change broadcasting or extensions; the layer above owns all of that.
///
/// # Invariants
///
/// - `commit` publishes all staged writes atomically or none of them
/// - A read at snapshot `s` is unaffected by commits after `s`
/// - Handles opened from one engine observe a single shared history
/// - Engines must be `Send + Sync`; handles must be `Send`
///
/// # Implementors
///
/// - [`super::MemoryEngine`] - ephemeral, for tests and scratch stores
/// - [`super::FileEngine`] - durable, append-only change log
pub trait StoreEngine: Send + Sync {
    /// Opens a new handle onto this engine's shared history.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot allocate a handle.
    fn open_handle(&self) -> StorageResult<Box<dyn StoreHandle>>;

    /// Returns the resolved file locations backing this engine.
    fn paths(&self) -> StorePaths;

    /// Hints that no reader will request snapshots below `min_snapshot`.
    ///
    /// Engines may use this to drop unreachable row versions. The
    /// default does nothing.
    fn compact(&self, min_snapshot: u64) {
        let _ = min_snapshot;
    }
}

/// One checked-out handle onto a store.
///
/// A handle is used by a single owner at a time: reads take `&self`,
/// staged writes take `&mut self`. Staged writes are invisible to every
/// reader (including this handle's own reads) until `commit` publishes
/// them.
pub trait StoreHandle: Send {
    /// Returns the snapshot of the most recent commit (0 when empty).
    fn committed_snapshot(&self) -> u64;

    /// Reads the row for `(collection, key)` visible at `snapshot`.
    fn get(&self, collection: &str, key: &str, snapshot: u64) -> Option<StoredRow>;

    /// Returns the keys live in `collection` at `snapshot`, sorted.
    fn keys(&self, collection: &str, snapshot: u64) -> Vec<String>;

    /// Returns the collections with at least one live key at `snapshot`, sorted.
    fn collections(&self, snapshot: u64) -> Vec<String>;

    /// Returns the number of live keys in `collection` at `snapshot`.
    fn row_count(&self, collection: &str, snapshot: u64) -> usize;

    /// Stages an insert or update of `(collection, key)`.
    fn stage_put(&mut self, collection: &str, key: &str, row: StoredRow);

    /// Stages a removal of `(collection, key)`.
    fn stage_remove(&mut self, collection: &str, key: &str);

    /// Stages removal of every key in `collection`.
    fn stage_remove_collection(&mut self, collection: &str);

    /// Returns the number of operations currently staged.
    fn staged_len(&self) -> usize;

    /// Atomically publishes all staged writes under `new_snapshot`.
    ///
    /// On success the staged set is empty and `committed_snapshot`
    /// returns `new_snapshot`. On failure nothing is published and the
    /// staged set is preserved for inspection until `rollback`.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_snapshot` does not advance the committed
    /// snapshot or if the engine fails to persist the writes.
    fn commit(&mut self, new_snapshot: u64) -> StorageResult<()>;

    /// Discards all staged writes.
    fn rollback(&mut self);
}
