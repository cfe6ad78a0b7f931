//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur inside a storage engine.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The change log on disk is corrupted.
    #[error("log corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Another process holds the store's exclusive lock.
    #[error("store is locked by another process: {path}")]
    Locked {
        /// The lock file that could not be acquired.
        path: PathBuf,
    },

    /// A commit was proposed with a snapshot at or below the committed one.
    #[error("stale commit: proposed snapshot {proposed}, committed {committed}")]
    StaleCommit {
        /// The snapshot the commit attempted to publish.
        proposed: u64,
        /// The snapshot already committed.
        committed: u64,
    },
}

impl StorageError {
    /// Create a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}
