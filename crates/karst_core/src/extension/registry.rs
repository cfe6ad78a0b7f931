//! Registration records and the in-process extension registry.
//!
//! A registration writes a [`RegistrationRecord`] into the reserved
//! registry collection under the extension's name. The record is what a
//! later run compares against to decide between resuming and
//! rebuilding, and what the orphan sweep consults to find state whose
//! extension was never re-registered.

use super::{extension_prefix, Extension};
use crate::error::{CoreError, CoreResult};
use crate::transaction::WriteTransaction;
use crate::types::REGISTRY_COLLECTION;
use karst_codec::{to_canonical_bytes, Value};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What one registration persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RegistrationRecord {
    pub(crate) kind: String,
    pub(crate) version: u32,
    /// Canonical encoding of the extension's configuration value.
    pub(crate) config: Vec<u8>,
}

impl RegistrationRecord {
    /// The record a registration of `extension` would persist.
    pub(crate) fn describe(extension: &dyn Extension) -> CoreResult<Self> {
        Ok(Self {
            kind: extension.kind().to_string(),
            version: extension.version(),
            config: to_canonical_bytes(&extension.config())?,
        })
    }

    fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes).map_err(|error| {
            CoreError::invalid_registry(format!("failed to encode record: {error}"))
        })?;
        Ok(bytes)
    }

    fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        ciborium::from_reader(bytes).map_err(|error| {
            CoreError::invalid_registry(format!("failed to decode record: {error}"))
        })
    }
}

/// Reads the persisted registration record for `name`, if any.
pub(crate) fn persisted_record(
    txn: &WriteTransaction<'_>,
    name: &str,
) -> CoreResult<Option<RegistrationRecord>> {
    match txn.raw_get(REGISTRY_COLLECTION, name)? {
        None => Ok(None),
        Some(Value::Bytes(bytes)) => Ok(Some(RegistrationRecord::from_bytes(&bytes)?)),
        Some(other) => Err(CoreError::invalid_registry(format!(
            "record for {name:?} is not a byte string: {other:?}"
        ))),
    }
}

/// Stages the registration record for `name`.
pub(crate) fn persist_record(
    txn: &mut WriteTransaction<'_>,
    name: &str,
    record: &RegistrationRecord,
) -> CoreResult<()> {
    let bytes = record.to_bytes()?;
    txn.raw_put(REGISTRY_COLLECTION, name, &Value::Bytes(bytes))
}

/// Stages removal of the registration record for `name`.
pub(crate) fn remove_record(txn: &mut WriteTransaction<'_>, name: &str) {
    txn.raw_remove(REGISTRY_COLLECTION, name);
}

/// The names with a persisted registration record, sorted.
pub(crate) fn persisted_names(txn: &WriteTransaction<'_>) -> Vec<String> {
    txn.raw_keys(REGISTRY_COLLECTION)
}

/// Stages removal of every collection owned by extension `name`.
pub(crate) fn drop_extension_tables(txn: &mut WriteTransaction<'_>, name: &str) -> CoreResult<()> {
    let prefix = extension_prefix(name);
    for collection in txn.raw_collections() {
        if collection.starts_with(&prefix) {
            txn.extension_remove_collection(&collection)?;
        }
    }
    Ok(())
}

/// The extension instances alive in this process, in registration
/// order.
///
/// Commit processing iterates in this order, so an extension can rely
/// on extensions registered before it having already folded in the
/// commit.
#[derive(Default)]
pub(crate) struct ExtensionRegistry {
    entries: RwLock<Vec<(String, Arc<dyn Extension>)>>,
}

impl ExtensionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds an instance under `name`, replacing in place if the name is
    /// already registered.
    pub(crate) fn insert(&self, name: &str, extension: Arc<dyn Extension>) {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|(existing, _)| existing == name) {
            Some(entry) => entry.1 = extension,
            None => entries.push((name.to_string(), extension)),
        }
    }

    pub(crate) fn remove(&self, name: &str) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(existing, _)| existing != name);
        entries.len() != before
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<dyn Extension>> {
        self.entries
            .read()
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, extension)| Arc::clone(extension))
    }

    /// Instances in registration order.
    pub(crate) fn entries(&self) -> Vec<(String, Arc<dyn Extension>)> {
        self.entries.read().clone()
    }

    /// Registered names, in registration order.
    pub(crate) fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("names", &self.names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::CommitChanges;

    struct Dummy {
        version: u32,
    }

    impl Extension for Dummy {
        fn kind(&self) -> &str {
            "dummy"
        }
        fn version(&self) -> u32 {
            self.version
        }
        fn config(&self) -> Value {
            Value::map(vec![(Value::from("v"), Value::from(self.version))])
        }
        fn populate(&self, _name: &str, _txn: &mut WriteTransaction<'_>) -> CoreResult<()> {
            Ok(())
        }
        fn process_commit(
            &self,
            _name: &str,
            _txn: &mut WriteTransaction<'_>,
            _changes: &CommitChanges,
        ) -> CoreResult<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    #[test]
    fn records_round_trip_and_compare() {
        let record = RegistrationRecord::describe(&Dummy { version: 3 }).unwrap();
        let bytes = record.to_bytes().unwrap();
        let decoded = RegistrationRecord::from_bytes(&bytes).unwrap();
        assert_eq!(record, decoded);

        let other = RegistrationRecord::describe(&Dummy { version: 4 }).unwrap();
        assert_ne!(record, other);
    }

    #[test]
    fn garbage_record_bytes_are_an_error() {
        assert!(RegistrationRecord::from_bytes(&[0xff, 0x00, 0x13]).is_err());
    }

    #[test]
    fn registry_preserves_registration_order() {
        let registry = ExtensionRegistry::new();
        registry.insert("b", Arc::new(Dummy { version: 1 }));
        registry.insert("a", Arc::new(Dummy { version: 1 }));
        assert_eq!(registry.names(), vec!["b".to_string(), "a".to_string()]);

        // Replacement keeps the original position
        registry.insert("b", Arc::new(Dummy { version: 2 }));
        assert_eq!(registry.names(), vec!["b".to_string(), "a".to_string()]);
        assert_eq!(registry.get("b").unwrap().version(), 2);

        assert!(registry.remove("b"));
        assert!(!registry.remove("b"));
        assert_eq!(registry.names(), vec!["a".to_string()]);
    }
}
