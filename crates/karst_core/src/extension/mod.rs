//! Transactional extensions.
//!
//! An extension maintains derived state (a secondary index, a view, a
//! log) inside private `ext:` collections. It participates in every
//! read-write commit through [`Extension::process_commit`], so primary
//! data and derived state always publish under the same snapshot:
//! either both commit or neither does.
//!
//! Registration persists a record of the extension's kind, version and
//! configuration. On a later run, registering the same extension again
//! recognizes the record and skips the rebuild; registering a changed
//! one rebuilds from scratch.

mod registry;
mod value_index;

pub use value_index::ValueIndex;

pub(crate) use registry::{
    drop_extension_tables, persist_record, persisted_names, persisted_record, remove_record,
    ExtensionRegistry, RegistrationRecord,
};

use crate::changeset::CommitChanges;
use crate::error::{CoreError, CoreResult};
use crate::transaction::WriteTransaction;
use karst_codec::Value;

/// A derived-state plugin that stays transactionally consistent with
/// the primary data.
///
/// Implementations must be stateless with respect to the database:
/// everything they maintain lives in their `ext:` collections, written
/// through the transaction they are handed. The same instance may serve
/// concurrent commits from different connections (one at a time, since
/// writes are serialized).
pub trait Extension: Send + Sync {
    /// Stable identifier of the algorithm this extension implements.
    fn kind(&self) -> &str;

    /// Version of the derived-state format. Bumping it forces a rebuild
    /// on the next registration.
    fn version(&self) -> u32;

    /// The configuration that shapes the derived state. Registration
    /// compares its canonical encoding against the persisted record to
    /// decide whether a rebuild is needed.
    fn config(&self) -> Value;

    /// Builds the derived state from scratch by scanning the current
    /// data. Runs inside the registration transaction under the
    /// registered `name`.
    fn populate(&self, name: &str, txn: &mut WriteTransaction<'_>) -> CoreResult<()>;

    /// Folds one commit's changes into the derived state. Runs inside
    /// the committing transaction, before anything becomes durable; an
    /// error aborts the whole commit.
    ///
    /// May return a delta payload, carried verbatim on the published
    /// change set for observers that mirror the derived state.
    fn process_commit(
        &self,
        name: &str,
        txn: &mut WriteTransaction<'_>,
        changes: &CommitChanges,
    ) -> CoreResult<Option<Vec<u8>>>;
}

/// The collection in which extension `name` stores its `table` rows.
#[must_use]
pub fn extension_table(name: &str, table: &str) -> String {
    format!("ext:{name}:{table}")
}

/// Prefix shared by every collection owned by extension `name`.
pub(crate) fn extension_prefix(name: &str) -> String {
    format!("ext:{name}:")
}

/// Registration names become collection name segments, so the segment
/// separator is forbidden in them.
pub(crate) fn validate_extension_name(name: &str) -> CoreResult<()> {
    if name.is_empty() || name.contains(':') {
        return Err(CoreError::InvalidExtensionName {
            name: name.to_string(),
        });
    }
    Ok(())
}
