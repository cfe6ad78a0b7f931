//! Secondary index over one field of stored objects.

use super::{extension_table, Extension};
use crate::changeset::{CommitChanges, RowChange};
use crate::error::CoreResult;
use crate::transaction::{ReadTransaction, WriteTransaction};
use karst_codec::{to_canonical_bytes, Value};
use std::collections::BTreeSet;

const POSTINGS_TABLE: &str = "by";

/// Indexes one field of the objects in one collection, answering "which
/// keys carry this value" without a scan.
///
/// Postings live in the extension's `by` table: one row per distinct
/// field value, holding the sorted keys whose objects carry it. The
/// index is maintained inside every commit, so a lookup always agrees
/// exactly with the data at the same snapshot.
///
/// Text, integer and boolean field values are indexed; rows whose field
/// is missing or of another type are simply not listed.
#[derive(Debug, Clone)]
pub struct ValueIndex {
    collection: String,
    field: String,
}

impl ValueIndex {
    /// Index `field` of the objects stored in `collection`.
    #[must_use]
    pub fn new(collection: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            field: field.into(),
        }
    }

    /// The keys whose objects carry `value` in the indexed field,
    /// sorted. `name` is the name the index was registered under.
    ///
    /// # Errors
    ///
    /// Returns an error if the posting row fails to decode.
    pub fn lookup(
        txn: &ReadTransaction<'_>,
        name: &str,
        value: &Value,
    ) -> CoreResult<Vec<String>> {
        let Some(slot) = posting_slot(value) else {
            return Ok(Vec::new());
        };
        let table = extension_table(name, POSTINGS_TABLE);
        Ok(txn
            .extension_get(&table, &slot)?
            .map(|postings| read_postings(&postings))
            .unwrap_or_default())
    }

    /// [`lookup`](Self::lookup) inside a read-write transaction,
    /// observing its uncommitted writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the posting row fails to decode.
    pub fn lookup_mut(
        txn: &WriteTransaction<'_>,
        name: &str,
        value: &Value,
    ) -> CoreResult<Vec<String>> {
        let Some(slot) = posting_slot(value) else {
            return Ok(Vec::new());
        };
        let table = extension_table(name, POSTINGS_TABLE);
        Ok(txn
            .extension_get(&table, &slot)?
            .map(|postings| read_postings(&postings))
            .unwrap_or_default())
    }

    fn indexed_slot(&self, object: &Value) -> Option<String> {
        object.get(&self.field).and_then(posting_slot)
    }

    fn add_posting(
        &self,
        txn: &mut WriteTransaction<'_>,
        name: &str,
        slot: &str,
        key: &str,
    ) -> CoreResult<()> {
        let table = extension_table(name, POSTINGS_TABLE);
        let mut keys = txn
            .extension_get(&table, slot)?
            .map(|postings| read_postings(&postings))
            .unwrap_or_default();
        if let Err(position) = keys.binary_search_by(|existing| existing.as_str().cmp(key)) {
            keys.insert(position, key.to_string());
            txn.extension_put(&table, slot, &write_postings(&keys))?;
        }
        Ok(())
    }

    fn remove_posting(
        &self,
        txn: &mut WriteTransaction<'_>,
        name: &str,
        slot: &str,
        key: &str,
    ) -> CoreResult<()> {
        let table = extension_table(name, POSTINGS_TABLE);
        let mut keys = txn
            .extension_get(&table, slot)?
            .map(|postings| read_postings(&postings))
            .unwrap_or_default();
        if let Ok(position) = keys.binary_search_by(|existing| existing.as_str().cmp(key)) {
            keys.remove(position);
            if keys.is_empty() {
                txn.extension_remove(&table, slot)?;
            } else {
                txn.extension_put(&table, slot, &write_postings(&keys))?;
            }
        }
        Ok(())
    }
}

impl Extension for ValueIndex {
    fn kind(&self) -> &str {
        "value-index"
    }

    fn version(&self) -> u32 {
        1
    }

    fn config(&self) -> Value {
        Value::map(vec![
            (
                Value::from("collection"),
                Value::from(self.collection.as_str()),
            ),
            (Value::from("field"), Value::from(self.field.as_str())),
        ])
    }

    fn populate(&self, name: &str, txn: &mut WriteTransaction<'_>) -> CoreResult<()> {
        for key in txn.keys(&self.collection) {
            let Some(object) = txn.get(&self.collection, &key) else {
                continue;
            };
            if let Some(slot) = self.indexed_slot(&object) {
                self.add_posting(txn, name, &slot, &key)?;
            }
        }
        Ok(())
    }

    fn process_commit(
        &self,
        name: &str,
        txn: &mut WriteTransaction<'_>,
        changes: &CommitChanges,
    ) -> CoreResult<Option<Vec<u8>>> {
        let cleared = changes.did_remove_all()
            || changes
                .removed_collections()
                .iter()
                .any(|collection| collection == &self.collection);
        if cleared {
            txn.extension_remove_collection(&extension_table(name, POSTINGS_TABLE))?;
        }

        let mut touched = BTreeSet::new();
        for (row_key, change) in changes.objects() {
            if row_key.collection != self.collection {
                continue;
            }
            // After a clear every pre-commit posting is already gone
            let previous = if cleared {
                None
            } else {
                txn.get_committed(&self.collection, &row_key.key)
                    .as_deref()
                    .and_then(|object| self.indexed_slot(object))
            };
            let next = match change {
                RowChange::Updated(object) => self.indexed_slot(object),
                RowChange::Removed => None,
            };
            if previous == next {
                continue;
            }
            if let Some(slot) = &previous {
                self.remove_posting(txn, name, slot, &row_key.key)?;
                touched.insert(slot.clone());
            }
            if let Some(slot) = &next {
                self.add_posting(txn, name, slot, &row_key.key)?;
                touched.insert(slot.clone());
            }
        }

        if touched.is_empty() && !cleared {
            return Ok(None);
        }
        let delta = Value::Array(touched.into_iter().map(Value::from).collect());
        Ok(Some(to_canonical_bytes(&delta)?))
    }
}

/// The posting row a field value is indexed under, if it is indexable.
/// Slots are prefixed by type so `1` and `"1"` never collide.
fn posting_slot(value: &Value) -> Option<String> {
    match value {
        Value::Text(text) => Some(format!("t:{text}")),
        Value::Integer(n) => Some(format!("i:{n}")),
        Value::Bool(b) => Some(format!("b:{b}")),
        _ => None,
    }
}

fn read_postings(postings: &Value) -> Vec<String> {
    postings
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_text().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn write_postings(keys: &[String]) -> Value {
    Value::Array(keys.iter().map(|key| Value::from(key.as_str())).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LruCache;
    use crate::serializers::HookTable;
    use crate::transaction::ValueCache;
    use crate::types::Snapshot;
    use karst_storage::{MemoryEngine, StoreEngine, StoreHandle};
    use std::cell::RefCell;

    struct Harness {
        handle: Box<dyn StoreHandle>,
        hooks: HookTable,
        object_cache: RefCell<ValueCache>,
        metadata_cache: RefCell<ValueCache>,
        snapshot: Snapshot,
    }

    impl Harness {
        fn txn(&mut self) -> WriteTransaction<'_> {
            WriteTransaction::new(
                self.handle.as_mut(),
                self.snapshot,
                &self.hooks,
                &self.object_cache,
                &self.metadata_cache,
            )
        }

        fn commit(&mut self) {
            let next = self.snapshot.next();
            self.handle.commit(next.value()).unwrap();
            self.snapshot = next;
            self.object_cache.borrow_mut().clear();
            self.metadata_cache.borrow_mut().clear();
        }
    }

    fn create_harness() -> Harness {
        let engine = MemoryEngine::new();
        Harness {
            handle: engine.open_handle().unwrap(),
            hooks: HookTable::new(),
            object_cache: RefCell::new(LruCache::new(64)),
            metadata_cache: RefCell::new(LruCache::new(64)),
            snapshot: Snapshot::ZERO,
        }
    }

    fn note(author: &str) -> Value {
        Value::map(vec![(Value::from("author"), Value::from(author))])
    }

    #[test]
    fn populate_indexes_existing_rows() {
        let mut harness = create_harness();
        {
            let mut txn = harness.txn();
            txn.put("notes", "n1", note("ada")).unwrap();
            txn.put("notes", "n2", note("brian")).unwrap();
            txn.put("notes", "n3", note("ada")).unwrap();
            // No author field; stays unindexed
            txn.put("notes", "n4", Value::map(vec![])).unwrap();
        }
        harness.commit();

        let index = ValueIndex::new("notes", "author");
        let mut txn = harness.txn();
        index.populate("by-author", &mut txn).unwrap();

        assert_eq!(
            ValueIndex::lookup_mut(&txn, "by-author", &Value::from("ada")).unwrap(),
            vec!["n1".to_string(), "n3".to_string()]
        );
        assert_eq!(
            ValueIndex::lookup_mut(&txn, "by-author", &Value::from("brian")).unwrap(),
            vec!["n2".to_string()]
        );
        assert!(
            ValueIndex::lookup_mut(&txn, "by-author", &Value::from("carol"))
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn commits_move_postings_between_slots() {
        let index = ValueIndex::new("notes", "author");
        let mut harness = create_harness();
        {
            let mut txn = harness.txn();
            txn.put("notes", "n1", note("ada")).unwrap();
            index.populate("by-author", &mut txn).unwrap();
        }
        harness.commit();

        let mut txn = harness.txn();
        txn.put("notes", "n1", note("brian")).unwrap();
        let changes = txn.commit_changes();
        let delta = index
            .process_commit("by-author", &mut txn, &changes)
            .unwrap();
        assert!(delta.is_some());

        assert!(
            ValueIndex::lookup_mut(&txn, "by-author", &Value::from("ada"))
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            ValueIndex::lookup_mut(&txn, "by-author", &Value::from("brian")).unwrap(),
            vec!["n1".to_string()]
        );
    }

    #[test]
    fn removals_drop_empty_posting_rows() {
        let index = ValueIndex::new("notes", "author");
        let mut harness = create_harness();
        {
            let mut txn = harness.txn();
            txn.put("notes", "n1", note("ada")).unwrap();
            index.populate("by-author", &mut txn).unwrap();
        }
        harness.commit();

        let mut txn = harness.txn();
        txn.remove("notes", "n1").unwrap();
        let changes = txn.commit_changes();
        index
            .process_commit("by-author", &mut txn, &changes)
            .unwrap();

        assert!(txn
            .extension_keys(&extension_table("by-author", POSTINGS_TABLE))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn unchanged_slot_produces_no_delta() {
        let index = ValueIndex::new("notes", "author");
        let mut harness = create_harness();
        {
            let mut txn = harness.txn();
            txn.put("notes", "n1", note("ada")).unwrap();
            index.populate("by-author", &mut txn).unwrap();
        }
        harness.commit();

        let mut txn = harness.txn();
        txn.put(
            "notes",
            "n1",
            Value::map(vec![
                (Value::from("author"), Value::from("ada")),
                (Value::from("starred"), Value::Bool(true)),
            ]),
        )
        .unwrap();
        let changes = txn.commit_changes();
        let delta = index
            .process_commit("by-author", &mut txn, &changes)
            .unwrap();
        assert!(delta.is_none());
        assert_eq!(
            ValueIndex::lookup_mut(&txn, "by-author", &Value::from("ada")).unwrap(),
            vec!["n1".to_string()]
        );
    }

    #[test]
    fn clearing_the_source_collection_drops_the_index() {
        let index = ValueIndex::new("notes", "author");
        let mut harness = create_harness();
        {
            let mut txn = harness.txn();
            txn.put("notes", "n1", note("ada")).unwrap();
            index.populate("by-author", &mut txn).unwrap();
        }
        harness.commit();

        let mut txn = harness.txn();
        txn.remove_collection("notes").unwrap();
        txn.put("notes", "n9", note("zoe")).unwrap();
        let changes = txn.commit_changes();
        index
            .process_commit("by-author", &mut txn, &changes)
            .unwrap();

        assert!(
            ValueIndex::lookup_mut(&txn, "by-author", &Value::from("ada"))
                .unwrap()
                .is_empty()
        );
        assert_eq!(
            ValueIndex::lookup_mut(&txn, "by-author", &Value::from("zoe")).unwrap(),
            vec!["n9".to_string()]
        );
    }

    #[test]
    fn integer_and_text_values_use_distinct_slots() {
        let index = ValueIndex::new("notes", "author");
        let mut harness = create_harness();
        let mut txn = harness.txn();

        txn.put(
            "notes",
            "n1",
            Value::map(vec![(Value::from("author"), Value::Integer(1))]),
        )
        .unwrap();
        txn.put(
            "notes",
            "n2",
            Value::map(vec![(Value::from("author"), Value::from("1"))]),
        )
        .unwrap();
        index.populate("by-author", &mut txn).unwrap();

        assert_eq!(
            ValueIndex::lookup_mut(&txn, "by-author", &Value::Integer(1)).unwrap(),
            vec!["n1".to_string()]
        );
        assert_eq!(
            ValueIndex::lookup_mut(&txn, "by-author", &Value::from("1")).unwrap(),
            vec!["n2".to_string()]
        );
    }
}
