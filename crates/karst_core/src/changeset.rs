//! Change tracking for read-write transactions.
//!
//! While a read-write transaction runs, a [`ChangeRecorder`] shadows
//! every staged write in deserialized form. The recorder serves two
//! jobs: it answers the transaction's own reads (a transaction observes
//! its writes) and, at commit, it becomes the immutable [`ChangeSet`]
//! broadcast to every other connection so they can update or invalidate
//! their caches without touching storage.

use crate::types::{ConnectionId, RowKey, Snapshot};
use karst_codec::Value;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// What happened to one row in a commit.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    /// The row was inserted or updated; carries the committed value.
    Updated(Arc<Value>),
    /// The row was removed.
    Removed,
}

/// The transaction-local view of a row, consulted before storage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Overlay<'a> {
    /// The transaction wrote this value.
    Value(&'a Arc<Value>),
    /// The transaction removed the row (directly or via a collection
    /// or whole-database clear).
    Absent,
    /// The transaction has not touched the row.
    Untouched,
}

/// Records the writes of one read-write transaction.
#[derive(Default)]
pub(crate) struct ChangeRecorder {
    objects: HashMap<RowKey, RowChange>,
    metadata: HashMap<RowKey, RowChange>,
    /// Rows written whose key was absent at the base snapshot.
    inserted: BTreeSet<RowKey>,
    removed_collections: BTreeSet<String>,
    all_removed: bool,
    custom_tag: Option<Arc<dyn Any + Send + Sync>>,
}

impl ChangeRecorder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_put(
        &mut self,
        key: RowKey,
        object: Arc<Value>,
        metadata: Option<Arc<Value>>,
        inserted: bool,
    ) {
        self.metadata.insert(
            key.clone(),
            match metadata {
                Some(value) => RowChange::Updated(value),
                None => RowChange::Removed,
            },
        );
        if inserted {
            self.inserted.insert(key.clone());
        }
        self.objects.insert(key, RowChange::Updated(object));
    }

    pub(crate) fn record_metadata(&mut self, key: RowKey, metadata: Option<Arc<Value>>) {
        self.metadata.insert(
            key,
            match metadata {
                Some(value) => RowChange::Updated(value),
                None => RowChange::Removed,
            },
        );
    }

    pub(crate) fn record_remove(&mut self, key: RowKey) {
        self.inserted.remove(&key);
        self.metadata.insert(key.clone(), RowChange::Removed);
        self.objects.insert(key, RowChange::Removed);
    }

    /// Records a collection clear, superseding earlier writes into it.
    pub(crate) fn record_remove_collection(&mut self, collection: &str) {
        self.objects.retain(|key, _| key.collection != collection);
        self.metadata.retain(|key, _| key.collection != collection);
        self.inserted.retain(|key| key.collection != collection);
        self.removed_collections.insert(collection.to_string());
    }

    /// Records a whole-database clear, superseding everything so far.
    pub(crate) fn record_remove_all(&mut self) {
        self.objects.clear();
        self.metadata.clear();
        self.inserted.clear();
        self.removed_collections.clear();
        self.all_removed = true;
    }

    pub(crate) fn set_custom_tag(&mut self, tag: Arc<dyn Any + Send + Sync>) {
        self.custom_tag = Some(tag);
    }

    pub(crate) fn clear(&mut self) {
        self.objects.clear();
        self.metadata.clear();
        self.inserted.clear();
        self.removed_collections.clear();
        self.all_removed = false;
        self.custom_tag = None;
    }

    /// Whether the transaction removed the whole collection (or all
    /// collections). The extension registry is exempt from
    /// whole-database clears.
    pub(crate) fn collection_cleared(&self, collection: &str) -> bool {
        (self.all_removed && collection != crate::types::REGISTRY_COLLECTION)
            || self.removed_collections.contains(collection)
    }

    pub(crate) fn object_overlay(&self, key: &RowKey) -> Overlay<'_> {
        Self::overlay(&self.objects, self.collection_cleared(&key.collection), key)
    }

    pub(crate) fn metadata_overlay(&self, key: &RowKey) -> Overlay<'_> {
        Self::overlay(
            &self.metadata,
            self.collection_cleared(&key.collection),
            key,
        )
    }

    fn overlay<'a>(
        map: &'a HashMap<RowKey, RowChange>,
        cleared: bool,
        key: &RowKey,
    ) -> Overlay<'a> {
        match map.get(key) {
            Some(RowChange::Updated(value)) => Overlay::Value(value),
            Some(RowChange::Removed) => Overlay::Absent,
            None if cleared => Overlay::Absent,
            None => Overlay::Untouched,
        }
    }

    /// Keys in `collection` written by this transaction.
    pub(crate) fn written_keys(&self, collection: &str) -> Vec<String> {
        self.objects
            .iter()
            .filter(|(key, change)| {
                key.collection == collection && matches!(change, RowChange::Updated(_))
            })
            .map(|(key, _)| key.key.clone())
            .collect()
    }

    /// Keys in `collection` removed by this transaction (individually).
    pub(crate) fn removed_keys(&self, collection: &str) -> Vec<String> {
        self.objects
            .iter()
            .filter(|(key, change)| {
                key.collection == collection && matches!(change, RowChange::Removed)
            })
            .map(|(key, _)| key.key.clone())
            .collect()
    }

    /// Collections this transaction wrote at least one row into.
    pub(crate) fn written_collections(&self) -> BTreeSet<String> {
        self.objects
            .iter()
            .filter(|(_, change)| matches!(change, RowChange::Updated(_)))
            .map(|(key, _)| key.collection.clone())
            .collect()
    }

    /// An owned snapshot of the recorded changes, handed to extensions.
    pub(crate) fn commit_changes(&self) -> CommitChanges {
        let mut objects: Vec<(RowKey, RowChange)> = self
            .objects
            .iter()
            .map(|(key, change)| (key.clone(), change.clone()))
            .collect();
        objects.sort_by(|a, b| a.0.cmp(&b.0));
        let mut metadata: Vec<(RowKey, RowChange)> = self
            .metadata
            .iter()
            .map(|(key, change)| (key.clone(), change.clone()))
            .collect();
        metadata.sort_by(|a, b| a.0.cmp(&b.0));
        CommitChanges {
            objects,
            metadata,
            removed_collections: self.removed_collections.iter().cloned().collect(),
            all_removed: self.all_removed,
        }
    }

    /// Seals the recorder into the change set published for `snapshot`.
    pub(crate) fn finish(
        self,
        snapshot: Snapshot,
        origin: ConnectionId,
        extension_deltas: BTreeMap<String, Vec<u8>>,
    ) -> ChangeSet {
        ChangeSet {
            snapshot,
            origin,
            objects: self.objects,
            metadata: self.metadata,
            inserted: self.inserted,
            removed_collections: self.removed_collections,
            all_removed: self.all_removed,
            custom_tag: self.custom_tag,
            extension_deltas,
        }
    }
}

/// The changes recorded so far by a running read-write transaction.
///
/// Extensions receive this during commit processing so they can update
/// their derived state incrementally.
#[derive(Debug, Clone)]
pub struct CommitChanges {
    objects: Vec<(RowKey, RowChange)>,
    metadata: Vec<(RowKey, RowChange)>,
    removed_collections: Vec<String>,
    all_removed: bool,
}

impl CommitChanges {
    /// Object changes in key order.
    pub fn objects(&self) -> impl Iterator<Item = (&RowKey, &RowChange)> {
        self.objects.iter().map(|(key, change)| (key, change))
    }

    /// Metadata changes in key order.
    pub fn metadata(&self) -> impl Iterator<Item = (&RowKey, &RowChange)> {
        self.metadata.iter().map(|(key, change)| (key, change))
    }

    /// Collections cleared wholesale.
    #[must_use]
    pub fn removed_collections(&self) -> &[String] {
        &self.removed_collections
    }

    /// Whether the transaction cleared every collection.
    #[must_use]
    pub fn did_remove_all(&self) -> bool {
        self.all_removed
    }

    /// Whether nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
            && self.metadata.is_empty()
            && self.removed_collections.is_empty()
            && !self.all_removed
    }
}

/// Everything one committed read-write transaction changed.
///
/// Published once per modifying commit and applied by every connection
/// in snapshot order, exactly once. Values ride along as shared
/// allocations so connections with the identity cache policy can adopt
/// them without deserializing.
pub struct ChangeSet {
    snapshot: Snapshot,
    origin: ConnectionId,
    objects: HashMap<RowKey, RowChange>,
    metadata: HashMap<RowKey, RowChange>,
    inserted: BTreeSet<RowKey>,
    removed_collections: BTreeSet<String>,
    all_removed: bool,
    custom_tag: Option<Arc<dyn Any + Send + Sync>>,
    extension_deltas: BTreeMap<String, Vec<u8>>,
}

impl ChangeSet {
    /// The snapshot this commit published.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
    }

    /// The connection that committed this change set.
    #[must_use]
    pub fn origin(&self) -> ConnectionId {
        self.origin
    }

    /// Object changes, unordered.
    pub fn object_changes(&self) -> impl Iterator<Item = (&RowKey, &RowChange)> {
        self.objects.iter()
    }

    /// Metadata changes, unordered.
    pub fn metadata_changes(&self) -> impl Iterator<Item = (&RowKey, &RowChange)> {
        self.metadata.iter()
    }

    /// The object change for one row, if any.
    #[must_use]
    pub fn object_change(&self, key: &RowKey) -> Option<&RowChange> {
        self.objects.get(key)
    }

    /// Rows this commit created, sorted. A row counts as created when
    /// its key was absent at the transaction's base snapshot.
    pub fn inserted_keys(&self) -> impl Iterator<Item = &RowKey> {
        self.inserted.iter()
    }

    /// Rows this commit removed individually, unordered. Collections
    /// cleared wholesale are reported separately.
    pub fn removed_keys(&self) -> impl Iterator<Item = &RowKey> {
        self.objects
            .iter()
            .filter(|(_, change)| matches!(change, RowChange::Removed))
            .map(|(key, _)| key)
    }

    /// Collections cleared wholesale, sorted.
    pub fn removed_collections(&self) -> impl Iterator<Item = &str> {
        self.removed_collections.iter().map(String::as_str)
    }

    /// Whether the commit cleared every collection.
    #[must_use]
    pub fn did_remove_all(&self) -> bool {
        self.all_removed
    }

    /// Whether the commit touched the given row in any way.
    #[must_use]
    pub fn affects(&self, collection: &str, key: &str) -> bool {
        if self.all_removed || self.removed_collections.contains(collection) {
            return true;
        }
        let row_key = RowKey::new(collection, key);
        self.objects.contains_key(&row_key) || self.metadata.contains_key(&row_key)
    }

    /// The tag attached by the committing transaction, if any.
    ///
    /// Tags are opaque to the database; downcast to recover the
    /// concrete type.
    #[must_use]
    pub fn custom_tag(&self) -> Option<&Arc<dyn Any + Send + Sync>> {
        self.custom_tag.as_ref()
    }

    /// The delta produced by the named extension during this commit.
    #[must_use]
    pub fn extension_delta(&self, name: &str) -> Option<&[u8]> {
        self.extension_deltas.get(name).map(Vec::as_slice)
    }

    /// All extension deltas, ordered by extension name.
    pub fn extension_deltas(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.extension_deltas
            .iter()
            .map(|(name, delta)| (name.as_str(), delta.as_slice()))
    }
}

impl std::fmt::Debug for ChangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSet")
            .field("snapshot", &self.snapshot)
            .field("origin", &self.origin)
            .field("objects", &self.objects.len())
            .field("metadata", &self.metadata.len())
            .field("inserted", &self.inserted.len())
            .field("removed_collections", &self.removed_collections)
            .field("all_removed", &self.all_removed)
            .field("has_custom_tag", &self.custom_tag.is_some())
            .finish_non_exhaustive()
    }
}
