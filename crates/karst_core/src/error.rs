//! Error types for database operations.

use karst_codec::CodecError;
use karst_storage::StorageError;
use thiserror::Error;

/// Result type for database operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur while using a database.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The storage engine reported an error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A value could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A transaction was started from inside another transaction on the
    /// same connection.
    #[error("re-entrant transaction: {message}")]
    Reentrant {
        /// Description of the re-entrant call.
        message: String,
    },

    /// A read-write transaction was started while the current thread
    /// already holds one.
    #[error("a read-write transaction is already active on this thread")]
    NestedWrite,

    /// A read-write transaction was requested on a pinned connection.
    #[error("connection is pinned to snapshot {snapshot}; unpin before writing")]
    WritePinned {
        /// The snapshot the connection is pinned to.
        snapshot: u64,
    },

    /// The connection has surrendered its storage handle and can no
    /// longer serve transactions.
    #[error("connection is closed")]
    Closed,

    /// A write targeted a collection reserved for internal use.
    #[error("collection {collection:?} is reserved")]
    ReservedCollection {
        /// The rejected collection name.
        collection: String,
    },

    /// An extension storage operation targeted a collection outside the
    /// extension namespace.
    #[error("collection {collection:?} is not an extension collection")]
    ExtensionCollectionRequired {
        /// The rejected collection name.
        collection: String,
    },

    /// An extension name was empty or contained a reserved character.
    #[error("invalid extension name {name:?}")]
    InvalidExtensionName {
        /// The rejected name.
        name: String,
    },

    /// An extension was registered under a name that is already in use.
    #[error("extension name {name:?} is already registered")]
    ExtensionNameTaken {
        /// The contested name.
        name: String,
    },

    /// An extension reported a failure.
    #[error("extension {name:?} failed: {message}")]
    Extension {
        /// The extension's registered name.
        name: String,
        /// Description of the failure.
        message: String,
    },

    /// A persisted extension registration record could not be read.
    #[error("invalid extension registry record: {message}")]
    InvalidRegistry {
        /// Description of the problem.
        message: String,
    },
}

impl From<std::io::Error> for CoreError {
    fn from(error: std::io::Error) -> Self {
        Self::Storage(StorageError::from(error))
    }
}

impl CoreError {
    /// Create a re-entrancy error.
    pub fn reentrant(message: impl Into<String>) -> Self {
        Self::Reentrant {
            message: message.into(),
        }
    }

    /// Create an extension failure error.
    pub fn extension(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Extension {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a registry corruption error.
    pub fn invalid_registry(message: impl Into<String>) -> Self {
        Self::InvalidRegistry {
            message: message.into(),
        }
    }
}
