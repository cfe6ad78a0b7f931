//! Read-only transactions.

use super::{base_contains, base_metadata, base_object, base_row, ensure_extension, ValueCache};
use crate::error::CoreResult;
use crate::serializers::HookTable;
use crate::types::{is_reserved_collection, Snapshot};
use karst_codec::{from_bytes, Value};
use karst_storage::StoreHandle;
use std::cell::RefCell;
use std::sync::Arc;

/// A consistent, point-in-time view of the database.
///
/// Every read inside one transaction observes the same snapshot, no
/// matter what other connections commit meanwhile. Values come back as
/// shared allocations; repeated reads of an unchanged row are served
/// from the connection's cache without touching storage.
pub struct ReadTransaction<'a> {
    handle: &'a dyn StoreHandle,
    snapshot: Snapshot,
    hooks: &'a HookTable,
    object_cache: &'a RefCell<ValueCache>,
    metadata_cache: &'a RefCell<ValueCache>,
}

impl<'a> ReadTransaction<'a> {
    pub(crate) fn new(
        handle: &'a dyn StoreHandle,
        snapshot: Snapshot,
        hooks: &'a HookTable,
        object_cache: &'a RefCell<ValueCache>,
        metadata_cache: &'a RefCell<ValueCache>,
    ) -> Self {
        Self {
            handle,
            snapshot,
            hooks,
            object_cache,
            metadata_cache,
        }
    }

    /// The snapshot this transaction reads at.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
    }

    /// Reads the object stored for `(collection, key)`.
    ///
    /// Returns `None` for a missing row, and also for a row whose bytes
    /// no longer deserialize (logged once per fetch).
    #[must_use]
    pub fn get(&self, collection: &str, key: &str) -> Option<Arc<Value>> {
        base_object(
            self.handle,
            self.snapshot.value(),
            self.hooks,
            self.object_cache,
            collection,
            key,
        )
    }

    /// Reads the metadata stored for `(collection, key)`.
    #[must_use]
    pub fn get_metadata(&self, collection: &str, key: &str) -> Option<Arc<Value>> {
        base_metadata(
            self.handle,
            self.snapshot.value(),
            self.hooks,
            self.metadata_cache,
            collection,
            key,
        )
    }

    /// Reads both planes of a row with a single storage fetch.
    #[must_use]
    pub fn get_row(&self, collection: &str, key: &str) -> Option<(Arc<Value>, Option<Arc<Value>>)> {
        base_row(
            self.handle,
            self.snapshot.value(),
            self.hooks,
            self.object_cache,
            self.metadata_cache,
            collection,
            key,
        )
    }

    /// Whether a row exists, without deserializing it.
    #[must_use]
    pub fn contains(&self, collection: &str, key: &str) -> bool {
        base_contains(
            self.handle,
            self.snapshot.value(),
            self.object_cache,
            collection,
            key,
        )
    }

    /// The keys in `collection`, sorted.
    #[must_use]
    pub fn keys(&self, collection: &str) -> Vec<String> {
        self.handle.keys(collection, self.snapshot.value())
    }

    /// The non-empty user collections, sorted. Internal and extension
    /// collections are not listed.
    #[must_use]
    pub fn collections(&self) -> Vec<String> {
        self.handle
            .collections(self.snapshot.value())
            .into_iter()
            .filter(|collection| !is_reserved_collection(collection))
            .collect()
    }

    /// The number of rows in `collection`.
    #[must_use]
    pub fn row_count(&self, collection: &str) -> usize {
        self.handle.row_count(collection, self.snapshot.value())
    }

    /// Reads a row from an extension's private collection.
    ///
    /// Extension rows use the canonical encoding directly; user hooks
    /// and caches do not apply.
    ///
    /// # Errors
    ///
    /// Returns an error if `collection` is outside the `ext:` namespace
    /// or the stored bytes do not decode.
    pub fn extension_get(&self, collection: &str, key: &str) -> CoreResult<Option<Value>> {
        ensure_extension(collection)?;
        match self.handle.get(collection, key, self.snapshot.value()) {
            None => Ok(None),
            Some(row) => Ok(Some(from_bytes(&row.object)?)),
        }
    }

    /// The keys in an extension's private collection, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if `collection` is outside the `ext:` namespace.
    pub fn extension_keys(&self, collection: &str) -> CoreResult<Vec<String>> {
        ensure_extension(collection)?;
        Ok(self.handle.keys(collection, self.snapshot.value()))
    }
}

impl std::fmt::Debug for ReadTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadTransaction")
            .field("snapshot", &self.snapshot)
            .finish_non_exhaustive()
    }
}
