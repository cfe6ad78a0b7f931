//! In-memory versioned row store.

use crate::engine::{StoreEngine, StoreHandle};
use crate::error::{StorageError, StorageResult};
use crate::row::{StorePaths, StoredRow};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// One write staged on a handle, not yet published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StagedOp {
    /// Insert or update a row.
    Put {
        /// Collection the row belongs to.
        collection: String,
        /// Key within the collection.
        key: String,
        /// The new row payload.
        row: StoredRow,
    },
    /// Remove a row.
    Remove {
        /// Collection the row belongs to.
        collection: String,
        /// Key within the collection.
        key: String,
    },
    /// Remove every row in a collection.
    RemoveCollection {
        /// The collection to clear.
        collection: String,
    },
}

#[derive(Debug, Clone)]
struct RowVersion {
    snapshot: u64,
    /// `None` marks a tombstone.
    row: Option<StoredRow>,
}

/// Versioned row history shared by every handle of one engine.
///
/// Each key carries its committed versions in snapshot order; a read at
/// snapshot `s` sees the newest version at or below `s`. Key maps are
/// ordered so enumeration is deterministic.
#[derive(Debug, Default)]
pub(crate) struct RowHistory {
    committed: u64,
    rows: HashMap<String, BTreeMap<String, Vec<RowVersion>>>,
}

impl RowHistory {
    pub(crate) fn committed(&self) -> u64 {
        self.committed
    }

    pub(crate) fn visible(&self, collection: &str, key: &str, snapshot: u64) -> Option<&StoredRow> {
        self.rows
            .get(collection)?
            .get(key)?
            .iter()
            .rev()
            .find(|v| v.snapshot <= snapshot)
            .and_then(|v| v.row.as_ref())
    }

    pub(crate) fn keys(&self, collection: &str, snapshot: u64) -> Vec<String> {
        match self.rows.get(collection) {
            Some(keys) => keys
                .iter()
                .filter(|(_, versions)| is_live(versions, snapshot))
                .map(|(key, _)| key.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn collections(&self, snapshot: u64) -> Vec<String> {
        let mut names: Vec<String> = self
            .rows
            .iter()
            .filter(|(_, keys)| keys.values().any(|versions| is_live(versions, snapshot)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub(crate) fn row_count(&self, collection: &str, snapshot: u64) -> usize {
        match self.rows.get(collection) {
            Some(keys) => keys
                .values()
                .filter(|versions| is_live(versions, snapshot))
                .count(),
            None => 0,
        }
    }

    /// Publishes a batch of staged operations under `snapshot`.
    ///
    /// Operations apply in staged order, so a put followed by a removal
    /// of the same key within one batch nets out to a removal.
    pub(crate) fn apply(&mut self, ops: &[StagedOp], snapshot: u64) {
        for op in ops {
            match op {
                StagedOp::Put {
                    collection,
                    key,
                    row,
                } => {
                    let versions = self
                        .rows
                        .entry(collection.clone())
                        .or_default()
                        .entry(key.clone())
                        .or_default();
                    push_version(versions, snapshot, Some(row.clone()));
                }
                StagedOp::Remove { collection, key } => {
                    if let Some(versions) = self
                        .rows
                        .get_mut(collection)
                        .and_then(|keys| keys.get_mut(key))
                    {
                        if currently_live(versions) {
                            push_version(versions, snapshot, None);
                        }
                    }
                }
                StagedOp::RemoveCollection { collection } => {
                    if let Some(keys) = self.rows.get_mut(collection) {
                        for versions in keys.values_mut() {
                            if currently_live(versions) {
                                push_version(versions, snapshot, None);
                            }
                        }
                    }
                }
            }
        }
        self.committed = snapshot;
    }

    /// Drops versions no reader at or above `min_snapshot` can observe.
    pub(crate) fn compact(&mut self, min_snapshot: u64) {
        self.rows.retain(|_, keys| {
            keys.retain(|_, versions| {
                if let Some(base) = versions.iter().rposition(|v| v.snapshot <= min_snapshot) {
                    versions.drain(..base);
                }
                // A key whose only remaining version is an old tombstone is gone
                !(versions.len() == 1
                    && versions[0].row.is_none()
                    && versions[0].snapshot <= min_snapshot)
            });
            !keys.is_empty()
        });
    }
}

fn is_live(versions: &[RowVersion], snapshot: u64) -> bool {
    versions
        .iter()
        .rev()
        .find(|v| v.snapshot <= snapshot)
        .is_some_and(|v| v.row.is_some())
}

fn currently_live(versions: &[RowVersion]) -> bool {
    versions.last().is_some_and(|v| v.row.is_some())
}

/// Within one commit the same key keeps only its final state.
fn push_version(versions: &mut Vec<RowVersion>, snapshot: u64, row: Option<StoredRow>) {
    match versions.last_mut() {
        Some(last) if last.snapshot == snapshot => last.row = row,
        _ => versions.push(RowVersion { snapshot, row }),
    }
}

/// An ephemeral storage engine.
///
/// Suitable for tests and scratch databases. All handles share one
/// versioned history; nothing touches disk.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    history: Arc<RwLock<RowHistory>>,
}

impl MemoryEngine {
    /// Creates a new empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreEngine for MemoryEngine {
    fn open_handle(&self) -> StorageResult<Box<dyn StoreHandle>> {
        Ok(Box::new(MemoryHandle {
            history: Arc::clone(&self.history),
            staged: Vec::new(),
        }))
    }

    fn paths(&self) -> StorePaths {
        StorePaths::ephemeral()
    }

    fn compact(&self, min_snapshot: u64) {
        self.history.write().compact(min_snapshot);
    }
}

struct MemoryHandle {
    history: Arc<RwLock<RowHistory>>,
    staged: Vec<StagedOp>,
}

impl StoreHandle for MemoryHandle {
    fn committed_snapshot(&self) -> u64 {
        self.history.read().committed()
    }

    fn get(&self, collection: &str, key: &str, snapshot: u64) -> Option<StoredRow> {
        self.history.read().visible(collection, key, snapshot).cloned()
    }

    fn keys(&self, collection: &str, snapshot: u64) -> Vec<String> {
        self.history.read().keys(collection, snapshot)
    }

    fn collections(&self, snapshot: u64) -> Vec<String> {
        self.history.read().collections(snapshot)
    }

    fn row_count(&self, collection: &str, snapshot: u64) -> usize {
        self.history.read().row_count(collection, snapshot)
    }

    fn stage_put(&mut self, collection: &str, key: &str, row: StoredRow) {
        self.staged.push(StagedOp::Put {
            collection: collection.to_string(),
            key: key.to_string(),
            row,
        });
    }

    fn stage_remove(&mut self, collection: &str, key: &str) {
        self.staged.push(StagedOp::Remove {
            collection: collection.to_string(),
            key: key.to_string(),
        });
    }

    fn stage_remove_collection(&mut self, collection: &str) {
        self.staged.push(StagedOp::RemoveCollection {
            collection: collection.to_string(),
        });
    }

    fn staged_len(&self) -> usize {
        self.staged.len()
    }

    fn commit(&mut self, new_snapshot: u64) -> StorageResult<()> {
        let mut history = self.history.write();
        if new_snapshot <= history.committed() {
            return Err(StorageError::StaleCommit {
                proposed: new_snapshot,
                committed: history.committed(),
            });
        }
        history.apply(&self.staged, new_snapshot);
        drop(history);
        self.staged.clear();
        Ok(())
    }

    fn rollback(&mut self) {
        self.staged.clear();
    }
}
