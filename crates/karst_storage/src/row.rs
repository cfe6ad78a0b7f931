//! Row and path types shared across engines.

use std::path::PathBuf;

/// One stored row: serialized object bytes plus optional metadata bytes.
///
/// The engine treats both halves as opaque. Metadata travels with its
/// object but is written and read independently by the layer above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    /// Serialized object payload.
    pub object: Vec<u8>,
    /// Serialized metadata payload, if any.
    pub metadata: Option<Vec<u8>>,
}

impl StoredRow {
    /// Create a row with object bytes and no metadata.
    #[must_use]
    pub fn new(object: Vec<u8>) -> Self {
        Self {
            object,
            metadata: None,
        }
    }

    /// Create a row with object and metadata bytes.
    #[must_use]
    pub fn with_metadata(object: Vec<u8>, metadata: Vec<u8>) -> Self {
        Self {
            object,
            metadata: Some(metadata),
        }
    }
}

/// Resolved file locations backing a store.
///
/// Reported by the engine so a caller can clean up after the store
/// closes. An ephemeral engine reports no paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorePaths {
    /// The store's primary location (a directory for the file engine).
    pub primary: Option<PathBuf>,
    /// Auxiliary files (change log, lock file).
    pub auxiliary: Vec<PathBuf>,
}

impl StorePaths {
    /// Paths for an ephemeral store with no backing files.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self::default()
    }
}
