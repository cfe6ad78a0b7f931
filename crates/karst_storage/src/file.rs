//! Durable storage engine backed by an append-only change log.

use crate::engine::{StoreEngine, StoreHandle};
use crate::error::{StorageError, StorageResult};
use crate::log::LogRecord;
use crate::memory::{RowHistory, StagedOp};
use crate::row::{StorePaths, StoredRow};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

const LOG_FILE: &str = "changes.log";
const LOCK_FILE: &str = "LOCK";

/// A storage engine persisted to a directory on disk.
///
/// The directory holds an append-only change log and a `LOCK` file held
/// exclusively for the lifetime of the engine, so a second process (or a
/// second engine in this process) cannot open the same database.
///
/// On open the log is replayed into memory batch by batch; a batch only
/// takes effect once its commit marker is present. A torn tail from an
/// interrupted write is truncated away.
pub struct FileEngine {
    directory: PathBuf,
    history: Arc<RwLock<RowHistory>>,
    log: Arc<Mutex<File>>,
    _lock: File,
}

impl FileEngine {
    /// Opens a database directory, creating it if absent.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another engine holds the
    /// directory, [`StorageError::Corrupted`] if the log is damaged
    /// beyond its tail, or an I/O error.
    pub fn open(directory: impl AsRef<Path>) -> StorageResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory)?;

        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(directory.join(LOCK_FILE))?;
        lock.try_lock_exclusive()
            .map_err(|_| StorageError::Locked {
                path: directory.clone(),
            })?;

        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(directory.join(LOG_FILE))?;
        let mut data = Vec::new();
        log.read_to_end(&mut data)?;

        let (history, valid_len) = replay(&data)?;
        if valid_len < data.len() {
            warn!(
                path = %directory.display(),
                discarded = data.len() - valid_len,
                "discarding torn tail of change log"
            );
            log.set_len(valid_len as u64)?;
            log.sync_all()?;
        }
        debug!(
            path = %directory.display(),
            snapshot = history.committed(),
            "opened change log"
        );

        Ok(Self {
            directory,
            history: Arc::new(RwLock::new(history)),
            log: Arc::new(Mutex::new(log)),
            _lock: lock,
        })
    }
}

impl std::fmt::Debug for FileEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEngine")
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

impl StoreEngine for FileEngine {
    fn open_handle(&self) -> StorageResult<Box<dyn StoreHandle>> {
        Ok(Box::new(FileHandle {
            history: Arc::clone(&self.history),
            log: Arc::clone(&self.log),
            staged: Vec::new(),
        }))
    }

    fn paths(&self) -> StorePaths {
        StorePaths {
            primary: Some(self.directory.clone()),
            auxiliary: vec![
                self.directory.join(LOG_FILE),
                self.directory.join(LOCK_FILE),
            ],
        }
    }

    /// Trims in-memory history. The log itself is append-only and keeps
    /// every batch until the database is reopened and rewritten.
    fn compact(&self, min_snapshot: u64) {
        self.history.write().compact(min_snapshot);
    }
}

/// Rebuilds row history from raw log bytes.
///
/// Returns the history plus the byte offset just past the last complete
/// batch. Anything beyond that offset is a torn tail.
fn replay(data: &[u8]) -> StorageResult<(RowHistory, usize)> {
    let mut history = RowHistory::default();
    let mut batch: Vec<StagedOp> = Vec::new();
    let mut offset = 0;
    let mut valid_len = 0;

    loop {
        match LogRecord::decode(&data[offset..]) {
            Ok(Some((record, consumed))) => {
                offset += consumed;
                match record {
                    LogRecord::Commit { snapshot } => {
                        if snapshot <= history.committed() {
                            return Err(StorageError::corrupted(format!(
                                "log snapshot went backwards at {snapshot}"
                            )));
                        }
                        history.apply(&batch, snapshot);
                        batch.clear();
                        valid_len = offset;
                    }
                    other => {
                        if let Some(op) = other.into_staged() {
                            batch.push(op);
                        }
                    }
                }
            }
            Ok(None) => break,
            // A decode failure past the last commit marker is a torn
            // tail; the caller truncates it.
            Err(_) => break,
        }
    }
    Ok((history, valid_len))
}

struct FileHandle {
    history: Arc<RwLock<RowHistory>>,
    log: Arc<Mutex<File>>,
    staged: Vec<StagedOp>,
}

impl StoreHandle for FileHandle {
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
        // The history write lock is held across the file append, so
        // batches land in the log in snapshot order.
        let mut history = self.history.write();
        if new_snapshot <= history.committed() {
            return Err(StorageError::StaleCommit {
                proposed: new_snapshot,
                committed: history.committed(),
            });
        }

        let mut buffer = Vec::new();
        for op in &self.staged {
            LogRecord::from_staged(op).encode(&mut buffer);
        }
        LogRecord::Commit {
            snapshot: new_snapshot,
        }
        .encode(&mut buffer);

        {
            let mut log = self.log.lock();
            // If this fails partway the tail has no commit marker and is
            // dropped on the next open.
            log.write_all(&buffer)?;
            log.sync_all()?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn put(handle: &mut Box<dyn StoreHandle>, collection: &str, key: &str, data: &[u8]) {
        handle.stage_put(collection, key, StoredRow::new(data.to_vec()));
    }

    #[test]
    fn open_creates_directory_and_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let engine = FileEngine::open(&path).unwrap();

        assert!(path.join(LOG_FILE).exists());
        assert!(path.join(LOCK_FILE).exists());
        assert_eq!(engine.paths().primary, Some(path));
    }

    #[test]
    fn second_engine_on_same_directory_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        let _engine = FileEngine::open(&path).unwrap();

        let err = FileEngine::open(&path).unwrap_err();
        assert!(matches!(err, StorageError::Locked { .. }));
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        drop(FileEngine::open(&path).unwrap());
        FileEngine::open(&path).unwrap();
    }

    #[test]
    fn committed_rows_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");

        {
            let engine = FileEngine::open(&path).unwrap();
            let mut handle = engine.open_handle().unwrap();
            put(&mut handle, "notes", "a", b"one");
            handle.stage_put(
                "notes",
                "b",
                StoredRow::with_metadata(b"two".to_vec(), b"meta".to_vec()),
            );
            handle.commit(1).unwrap();
        }

        let engine = FileEngine::open(&path).unwrap();
        let handle = engine.open_handle().unwrap();
        assert_eq!(handle.committed_snapshot(), 1);
        assert_eq!(handle.get("notes", "a", 1), Some(StoredRow::new(b"one".to_vec())));
        assert_eq!(
            handle.get("notes", "b", 1),
            Some(StoredRow::with_metadata(b"two".to_vec(), b"meta".to_vec()))
        );
    }

    #[test]
    fn snapshot_history_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");

        {
            let engine = FileEngine::open(&path).unwrap();
            let mut handle = engine.open_handle().unwrap();
            put(&mut handle, "notes", "a", b"one");
            handle.commit(1).unwrap();
            put(&mut handle, "notes", "a", b"two");
            handle.commit(2).unwrap();
            handle.stage_remove("notes", "a");
            handle.commit(3).unwrap();
        }

        let engine = FileEngine::open(&path).unwrap();
        let handle = engine.open_handle().unwrap();
        assert_eq!(handle.committed_snapshot(), 3);
        assert_eq!(handle.get("notes", "a", 1), Some(StoredRow::new(b"one".to_vec())));
        assert_eq!(handle.get("notes", "a", 2), Some(StoredRow::new(b"two".to_vec())));
        assert_eq!(handle.get("notes", "a", 3), None);
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");

        {
            let engine = FileEngine::open(&path).unwrap();
            let mut handle = engine.open_handle().unwrap();
            put(&mut handle, "notes", "a", b"one");
            handle.commit(1).unwrap();
        }
        let clean_len = std::fs::metadata(path.join(LOG_FILE)).unwrap().len();

        // Simulate a crash partway through the next batch
        let mut record = Vec::new();
        LogRecord::Put {
            collection: "notes".to_string(),
            key: "b".to_string(),
            row: StoredRow::new(b"half".to_vec()),
        }
        .encode(&mut record);
        let mut file = OpenOptions::new()
            .append(true)
            .open(path.join(LOG_FILE))
            .unwrap();
        file.write_all(&record[..record.len() / 2]).unwrap();
        drop(file);

        let engine = FileEngine::open(&path).unwrap();
        let handle = engine.open_handle().unwrap();
        assert_eq!(handle.committed_snapshot(), 1);
        assert_eq!(handle.get("notes", "b", 1), None);
        assert_eq!(
            std::fs::metadata(path.join(LOG_FILE)).unwrap().len(),
            clean_len
        );
    }

    #[test]
    fn batch_without_commit_marker_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");

        {
            let engine = FileEngine::open(&path).unwrap();
            let mut handle = engine.open_handle().unwrap();
            put(&mut handle, "notes", "a", b"one");
            handle.commit(1).unwrap();
        }

        // A complete record with no commit marker after it
        let mut record = Vec::new();
        LogRecord::Put {
            collection: "notes".to_string(),
            key: "b".to_string(),
            row: StoredRow::new(b"orphan".to_vec()),
        }
        .encode(&mut record);
        let mut file = OpenOptions::new()
            .append(true)
            .open(path.join(LOG_FILE))
            .unwrap();
        file.write_all(&record).unwrap();
        drop(file);

        let engine = FileEngine::open(&path).unwrap();
        let handle = engine.open_handle().unwrap();
        assert_eq!(handle.get("notes", "b", 1), None);
        assert_eq!(handle.committed_snapshot(), 1);
    }

    #[test]
    fn handles_share_one_history() {
        let dir = tempdir().unwrap();
        let engine = FileEngine::open(dir.path().join("db")).unwrap();

        let mut writer = engine.open_handle().unwrap();
        let reader = engine.open_handle().unwrap();
        put(&mut writer, "notes", "a", b"one");
        writer.commit(1).unwrap();

        assert_eq!(reader.committed_snapshot(), 1);
        assert_eq!(reader.get("notes", "a", 1), Some(StoredRow::new(b"one".to_vec())));
    }

    #[test]
    fn empty_reopen_is_clean() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db");
        drop(FileEngine::open(&path).unwrap());

        let engine = FileEngine::open(&path).unwrap();
        let handle = engine.open_handle().unwrap();
        assert_eq!(handle.committed_snapshot(), 0);
        assert!(handle.collections(0).is_empty());
    }
}
