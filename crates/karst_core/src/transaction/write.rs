//! Read-write transactions.

use super::{
    base_contains, base_metadata, base_object, ensure_extension, ensure_writable, ValueCache,
};
use crate::changeset::{ChangeRecorder, Overlay};
use crate::error::CoreResult;
use crate::serializers::{HookPlane, HookTable};
use crate::types::{is_reserved_collection, RowKey, Snapshot, REGISTRY_COLLECTION};
use karst_codec::{from_bytes, to_canonical_bytes, Value};
use karst_storage::{StoreHandle, StoredRow};
use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// A transaction that can modify the database.
///
/// Writes are staged privately: this transaction observes them through
/// every read, while other connections see nothing until commit. The
/// closure-based API commits automatically on return unless
/// [`rollback`](Self::rollback) was called.
pub struct WriteTransaction<'a> {
    handle: &'a mut dyn StoreHandle,
    snapshot: Snapshot,
    hooks: &'a HookTable,
    object_cache: &'a RefCell<ValueCache>,
    metadata_cache: &'a RefCell<ValueCache>,
    recorder: ChangeRecorder,
    /// Extension and system rows staged by this transaction, which the
    /// change recorder does not track.
    ext_overlay: HashMap<RowKey, Option<Arc<Value>>>,
    rolled_back: bool,
}

impl<'a> WriteTransaction<'a> {
    pub(crate) fn new(
        handle: &'a mut dyn StoreHandle,
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
            recorder: ChangeRecorder::new(),
            ext_overlay: HashMap::new(),
            rolled_back: false,
        }
    }

    /// The snapshot this transaction started from. A successful
    /// modifying commit publishes the next snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
    }

    /// Reads an object, observing this transaction's own writes.
    #[must_use]
    pub fn get(&self, collection: &str, key: &str) -> Option<Arc<Value>> {
        let row_key = RowKey::new(collection, key);
        match self.recorder.object_overlay(&row_key) {
            Overlay::Value(value) => Some(Arc::clone(value)),
            Overlay::Absent => None,
            Overlay::Untouched => base_object(
                self.handle,
                self.snapshot.value(),
                self.hooks,
                self.object_cache,
                collection,
                key,
            ),
        }
    }

    /// Reads metadata, observing this transaction's own writes.
    #[must_use]
    pub fn get_metadata(&self, collection: &str, key: &str) -> Option<Arc<Value>> {
        let row_key = RowKey::new(collection, key);
        match self.recorder.metadata_overlay(&row_key) {
            Overlay::Value(value) => Some(Arc::clone(value)),
            Overlay::Absent => None,
            Overlay::Untouched => base_metadata(
                self.handle,
                self.snapshot.value(),
                self.hooks,
                self.metadata_cache,
                collection,
                key,
            ),
        }
    }

    /// Reads both planes of a row, observing this transaction's writes.
    #[must_use]
    pub fn get_row(&self, collection: &str, key: &str) -> Option<(Arc<Value>, Option<Arc<Value>>)> {
        let object = self.get(collection, key)?;
        Some((object, self.get_metadata(collection, key)))
    }

    /// Reads the object as committed at this transaction's snapshot,
    /// ignoring writes staged in this transaction. Extensions use this
    /// to compare a row's previous state against its new one.
    #[must_use]
    pub fn get_committed(&self, collection: &str, key: &str) -> Option<Arc<Value>> {
        base_object(
            self.handle,
            self.snapshot.value(),
            self.hooks,
            self.object_cache,
            collection,
            key,
        )
    }

    /// Whether a row exists, observing this transaction's writes.
    #[must_use]
    pub fn contains(&self, collection: &str, key: &str) -> bool {
        let row_key = RowKey::new(collection, key);
        match self.recorder.object_overlay(&row_key) {
            Overlay::Value(_) => true,
            Overlay::Absent => false,
            Overlay::Untouched => base_contains(
                self.handle,
                self.snapshot.value(),
                self.object_cache,
                collection,
                key,
            ),
        }
    }

    /// The keys in `collection`, observing this transaction's writes,
    /// sorted.
    #[must_use]
    pub fn keys(&self, collection: &str) -> Vec<String> {
        let mut merged: BTreeSet<String> = if self.recorder.collection_cleared(collection) {
            BTreeSet::new()
        } else {
            self.handle
                .keys(collection, self.snapshot.value())
                .into_iter()
                .collect()
        };
        for removed in self.recorder.removed_keys(collection) {
            merged.remove(&removed);
        }
        for written in self.recorder.written_keys(collection) {
            merged.insert(written);
        }
        merged.into_iter().collect()
    }

    /// The non-empty user collections, observing this transaction's
    /// writes, sorted.
    #[must_use]
    pub fn collections(&self) -> Vec<String> {
        let mut merged: BTreeSet<String> = self
            .handle
            .collections(self.snapshot.value())
            .into_iter()
            .filter(|collection| {
                !is_reserved_collection(collection) && !self.recorder.collection_cleared(collection)
            })
            .collect();
        for written in self.recorder.written_collections() {
            if !is_reserved_collection(&written) {
                merged.insert(written);
            }
        }
        merged.retain(|collection| !self.keys(collection).is_empty());
        merged.into_iter().collect()
    }

    /// The number of rows in `collection`, observing this transaction's
    /// writes.
    #[must_use]
    pub fn row_count(&self, collection: &str) -> usize {
        self.keys(collection).len()
    }

    /// Stores an object, clearing any metadata the row carried.
    ///
    /// # Errors
    ///
    /// Returns an error if `collection` is reserved or the value does
    /// not serialize.
    pub fn put(&mut self, collection: &str, key: &str, value: Value) -> CoreResult<()> {
        self.put_row(collection, key, value, None)
    }

    /// Stores an object together with its metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if `collection` is reserved or either value
    /// does not serialize.
    pub fn put_with_metadata(
        &mut self,
        collection: &str,
        key: &str,
        value: Value,
        metadata: Value,
    ) -> CoreResult<()> {
        self.put_row(collection, key, value, Some(metadata))
    }

    fn put_row(
        &mut self,
        collection: &str,
        key: &str,
        value: Value,
        metadata: Option<Value>,
    ) -> CoreResult<()> {
        ensure_writable(collection)?;
        let (object_value, object_bytes) = self.hooks.serialize_object(collection, key, value)?;
        let (metadata_value, row) = match metadata {
            Some(metadata) => {
                let (value, bytes) = self.hooks.serialize_metadata(collection, key, metadata)?;
                (Some(value), StoredRow::with_metadata(object_bytes, bytes))
            }
            None => (None, StoredRow::new(object_bytes)),
        };
        let inserted = self
            .handle
            .get(collection, key, self.snapshot.value())
            .is_none();
        self.handle.stage_put(collection, key, row);
        self.hooks
            .post_write(collection, key, HookPlane::Object, &object_value);
        if let Some(metadata_value) = &metadata_value {
            self.hooks
                .post_write(collection, key, HookPlane::Metadata, metadata_value);
        }
        self.recorder.record_put(
            RowKey::new(collection, key),
            object_value,
            metadata_value,
            inserted,
        );
        Ok(())
    }

    /// Replaces only the metadata of an existing row. A missing row is
    /// left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if `collection` is reserved or the metadata
    /// does not serialize.
    pub fn replace_metadata(
        &mut self,
        collection: &str,
        key: &str,
        metadata: Option<Value>,
    ) -> CoreResult<()> {
        ensure_writable(collection)?;
        let Some(object) = self.get(collection, key) else {
            return Ok(());
        };
        let object_bytes = self.hooks.encode_object(collection, key, &object)?;
        let (metadata_value, row) = match metadata {
            Some(metadata) => {
                let (value, bytes) = self.hooks.serialize_metadata(collection, key, metadata)?;
                (Some(value), StoredRow::with_metadata(object_bytes, bytes))
            }
            None => (None, StoredRow::new(object_bytes)),
        };
        self.handle.stage_put(collection, key, row);
        if let Some(metadata_value) = &metadata_value {
            self.hooks
                .post_write(collection, key, HookPlane::Metadata, metadata_value);
        }
        self.recorder
            .record_metadata(RowKey::new(collection, key), metadata_value);
        Ok(())
    }

    /// Removes a row. Removing a missing row is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if `collection` is reserved.
    pub fn remove(&mut self, collection: &str, key: &str) -> CoreResult<()> {
        ensure_writable(collection)?;
        if !self.contains(collection, key) {
            return Ok(());
        }
        self.handle.stage_remove(collection, key);
        self.recorder.record_remove(RowKey::new(collection, key));
        Ok(())
    }

    /// Removes every row in `collection`.
    ///
    /// # Errors
    ///
    /// Returns an error if `collection` is reserved.
    pub fn remove_collection(&mut self, collection: &str) -> CoreResult<()> {
        ensure_writable(collection)?;
        self.handle.stage_remove_collection(collection);
        self.recorder.record_remove_collection(collection);
        Ok(())
    }

    /// Removes every row in every collection, including extension
    /// state. Extension registrations survive.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature leaves room for engines that
    /// must report the clear.
    pub fn remove_all(&mut self) -> CoreResult<()> {
        let mut names: BTreeSet<String> = self
            .handle
            .collections(self.snapshot.value())
            .into_iter()
            .collect();
        names.extend(self.recorder.written_collections());
        for (row_key, staged) in &self.ext_overlay {
            if staged.is_some() {
                names.insert(row_key.collection.clone());
            }
        }
        names.remove(REGISTRY_COLLECTION);

        for name in &names {
            self.handle.stage_remove_collection(name);
        }
        self.recorder.record_remove_all();
        self.ext_overlay
            .retain(|row_key, _| row_key.collection == REGISTRY_COLLECTION);
        Ok(())
    }

    /// Discards every write staged so far and marks the transaction
    /// aborted: nothing will commit when the closure returns, even if
    /// more writes follow.
    pub fn rollback(&mut self) {
        self.handle.rollback();
        self.recorder.clear();
        self.ext_overlay.clear();
        self.rolled_back = true;
    }

    /// Attaches an opaque tag to this commit's change set, visible to
    /// every observer of the commit.
    pub fn set_custom_tag(&mut self, tag: Arc<dyn Any + Send + Sync>) {
        self.recorder.set_custom_tag(tag);
    }

    /// Reads a row from an extension's private collection, observing
    /// this transaction's writes.
    ///
    /// # Errors
    ///
    /// Returns an error if `collection` is outside the `ext:` namespace
    /// or the stored bytes do not decode.
    pub fn extension_get(&self, collection: &str, key: &str) -> CoreResult<Option<Value>> {
        ensure_extension(collection)?;
        self.raw_get(collection, key)
    }

    /// The keys in an extension's private collection, observing this
    /// transaction's writes, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if `collection` is outside the `ext:` namespace.
    pub fn extension_keys(&self, collection: &str) -> CoreResult<Vec<String>> {
        ensure_extension(collection)?;
        Ok(self.raw_keys(collection))
    }

    /// Writes a row into an extension's private collection.
    ///
    /// # Errors
    ///
    /// Returns an error if `collection` is outside the `ext:` namespace
    /// or the value does not serialize.
    pub fn extension_put(&mut self, collection: &str, key: &str, value: &Value) -> CoreResult<()> {
        ensure_extension(collection)?;
        self.raw_put(collection, key, value)
    }

    /// Removes a row from an extension's private collection.
    ///
    /// # Errors
    ///
    /// Returns an error if `collection` is outside the `ext:` namespace.
    pub fn extension_remove(&mut self, collection: &str, key: &str) -> CoreResult<()> {
        ensure_extension(collection)?;
        self.raw_remove(collection, key);
        Ok(())
    }

    /// Clears an extension's private collection.
    ///
    /// # Errors
    ///
    /// Returns an error if `collection` is outside the `ext:` namespace.
    pub fn extension_remove_collection(&mut self, collection: &str) -> CoreResult<()> {
        ensure_extension(collection)?;
        self.handle.stage_remove_collection(collection);
        self.recorder.record_remove_collection(collection);
        self.ext_overlay
            .retain(|row_key, _| row_key.collection != collection);
        Ok(())
    }

    // Internal row access for system collections; same machinery as
    // extension rows without the namespace check.

    pub(crate) fn raw_get(&self, collection: &str, key: &str) -> CoreResult<Option<Value>> {
        let row_key = RowKey::new(collection, key);
        if let Some(staged) = self.ext_overlay.get(&row_key) {
            return Ok(staged.as_ref().map(|value| (**value).clone()));
        }
        if self.recorder.collection_cleared(collection) {
            return Ok(None);
        }
        match self.handle.get(collection, key, self.snapshot.value()) {
            None => Ok(None),
            Some(row) => Ok(Some(from_bytes(&row.object)?)),
        }
    }

    pub(crate) fn raw_put(&mut self, collection: &str, key: &str, value: &Value) -> CoreResult<()> {
        let bytes = to_canonical_bytes(value)?;
        self.handle.stage_put(collection, key, StoredRow::new(bytes));
        self.ext_overlay
            .insert(RowKey::new(collection, key), Some(Arc::new(value.clone())));
        Ok(())
    }

    pub(crate) fn raw_remove(&mut self, collection: &str, key: &str) {
        self.handle.stage_remove(collection, key);
        self.ext_overlay
            .insert(RowKey::new(collection, key), None);
    }

    /// Every collection with at least one visible row, reserved names
    /// included, observing this transaction's writes.
    pub(crate) fn raw_collections(&self) -> Vec<String> {
        let mut merged: BTreeSet<String> = self
            .handle
            .collections(self.snapshot.value())
            .into_iter()
            .filter(|collection| !self.recorder.collection_cleared(collection))
            .collect();
        for (row_key, staged) in &self.ext_overlay {
            if staged.is_some() {
                merged.insert(row_key.collection.clone());
            }
        }
        for written in self.recorder.written_collections() {
            merged.insert(written);
        }
        merged.into_iter().collect()
    }

    pub(crate) fn raw_keys(&self, collection: &str) -> Vec<String> {
        let mut merged: BTreeSet<String> = if self.recorder.collection_cleared(collection) {
            BTreeSet::new()
        } else {
            self.handle
                .keys(collection, self.snapshot.value())
                .into_iter()
                .collect()
        };
        for (row_key, staged) in &self.ext_overlay {
            if row_key.collection != collection {
                continue;
            }
            match staged {
                Some(_) => {
                    merged.insert(row_key.key.clone());
                }
                None => {
                    merged.remove(&row_key.key);
                }
            }
        }
        merged.into_iter().collect()
    }

    /// Number of operations staged so far; a commit that staged nothing
    /// does not advance the snapshot.
    pub(crate) fn staged_len(&self) -> usize {
        self.handle.staged_len()
    }

    pub(crate) fn is_rolled_back(&self) -> bool {
        self.rolled_back
    }

    /// The changes recorded so far, for extension commit processing.
    pub(crate) fn commit_changes(&self) -> crate::changeset::CommitChanges {
        self.recorder.commit_changes()
    }

    /// Tears the transaction down for commit, releasing its borrows.
    pub(crate) fn into_parts(self) -> (ChangeRecorder, bool) {
        (self.recorder, self.rolled_back)
    }
}

impl std::fmt::Debug for WriteTransaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("snapshot", &self.snapshot)
            .field("staged", &self.handle.staged_len())
            .field("rolled_back", &self.rolled_back)
            .finish_non_exhaustive()
    }
}
