//! Read and read-write transactions.

mod read;
mod write;

pub use read::ReadTransaction;
pub use write::WriteTransaction;

use crate::cache::LruCache;
use crate::error::{CoreError, CoreResult};
use crate::serializers::HookTable;
use crate::types::{is_reserved_collection, RowKey, EXTENSION_PREFIX};
use karst_codec::Value;
use karst_storage::StoreHandle;
use std::cell::RefCell;
use std::sync::Arc;
use tracing::warn;

/// Cache of deserialized values; `None` records a known-absent row.
pub(crate) type ValueCache = LruCache<RowKey, Option<Arc<Value>>>;

/// Rejects writes into reserved collections.
fn ensure_writable(collection: &str) -> CoreResult<()> {
    if is_reserved_collection(collection) {
        return Err(CoreError::ReservedCollection {
            collection: collection.to_string(),
        });
    }
    Ok(())
}

/// Rejects extension storage operations outside the `ext:` namespace.
fn ensure_extension(collection: &str) -> CoreResult<()> {
    if !collection.starts_with(EXTENSION_PREFIX) {
        return Err(CoreError::ExtensionCollectionRequired {
            collection: collection.to_string(),
        });
    }
    Ok(())
}

/// Reads one object through the cache.
///
/// A row whose bytes fail to deserialize is reported once and treated
/// as absent, including in the cache, so a poisoned row cannot fail
/// every later read differently.
fn base_object(
    handle: &dyn StoreHandle,
    snapshot: u64,
    hooks: &HookTable,
    cache: &RefCell<ValueCache>,
    collection: &str,
    key: &str,
) -> Option<Arc<Value>> {
    let row_key = RowKey::new(collection, key);
    if let Some(hit) = cache.borrow_mut().get(&row_key) {
        return hit.clone();
    }
    let value = handle
        .get(collection, key, snapshot)
        .and_then(|row| decode_object(hooks, collection, key, &row.object));
    cache.borrow_mut().insert(row_key, value.clone());
    value
}

/// Reads one metadata value through the cache.
fn base_metadata(
    handle: &dyn StoreHandle,
    snapshot: u64,
    hooks: &HookTable,
    cache: &RefCell<ValueCache>,
    collection: &str,
    key: &str,
) -> Option<Arc<Value>> {
    let row_key = RowKey::new(collection, key);
    if let Some(hit) = cache.borrow_mut().get(&row_key) {
        return hit.clone();
    }
    let value = handle
        .get(collection, key, snapshot)
        .and_then(|row| row.metadata)
        .and_then(|bytes| decode_metadata(hooks, collection, key, &bytes));
    cache.borrow_mut().insert(row_key, value.clone());
    value
}

/// Reads both planes of one row with a single storage fetch.
fn base_row(
    handle: &dyn StoreHandle,
    snapshot: u64,
    hooks: &HookTable,
    object_cache: &RefCell<ValueCache>,
    metadata_cache: &RefCell<ValueCache>,
    collection: &str,
    key: &str,
) -> Option<(Arc<Value>, Option<Arc<Value>>)> {
    let row_key = RowKey::new(collection, key);
    let row = handle.get(collection, key, snapshot);
    let object = row
        .as_ref()
        .and_then(|row| decode_object(hooks, collection, key, &row.object));
    let metadata = row
        .and_then(|row| row.metadata)
        .and_then(|bytes| decode_metadata(hooks, collection, key, &bytes));
    object_cache.borrow_mut().insert(row_key.clone(), object.clone());
    metadata_cache.borrow_mut().insert(row_key, metadata.clone());
    object.map(|object| (object, metadata))
}

/// Row presence check; consults the object cache but never deserializes.
fn base_contains(
    handle: &dyn StoreHandle,
    snapshot: u64,
    cache: &RefCell<ValueCache>,
    collection: &str,
    key: &str,
) -> bool {
    let row_key = RowKey::new(collection, key);
    if let Some(hit) = cache.borrow_mut().get(&row_key) {
        return hit.is_some();
    }
    handle.get(collection, key, snapshot).is_some()
}

fn decode_object(
    hooks: &HookTable,
    collection: &str,
    key: &str,
    bytes: &[u8],
) -> Option<Arc<Value>> {
    match hooks.deserialize_object(collection, key, bytes) {
        Ok(value) => Some(Arc::new(value)),
        Err(error) => {
            warn!(collection, key, %error, "failed to deserialize object; treating as absent");
            None
        }
    }
}

fn decode_metadata(
    hooks: &HookTable,
    collection: &str,
    key: &str,
    bytes: &[u8],
) -> Option<Arc<Value>> {
    match hooks.deserialize_metadata(collection, key, bytes) {
        Ok(value) => Some(Arc::new(value)),
        Err(error) => {
            warn!(collection, key, %error, "failed to deserialize metadata; treating as absent");
            None
        }
    }
}
