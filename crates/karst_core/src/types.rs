//! Identifier types shared across the crate.

use std::fmt;

/// A point-in-time version of the database.
///
/// The snapshot number starts at zero for an empty database and advances
/// by exactly one for every read-write commit that modifies data.
/// Commits that stage nothing leave it unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Snapshot(u64);

impl Snapshot {
    /// The snapshot of an empty database.
    pub const ZERO: Snapshot = Snapshot(0);

    /// Wraps a raw snapshot number.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw snapshot number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The snapshot immediately after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one connection within its database for the lifetime of
/// the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) const fn new(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Addresses one row: a collection name plus a key within it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    /// The collection the row belongs to.
    pub collection: String,
    /// The key within the collection.
    pub key: String,
}

impl RowKey {
    /// Builds a row key.
    #[must_use]
    pub fn new(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.key)
    }
}

/// Prefix of collections that hold internal bookkeeping rows.
pub const SYSTEM_PREFIX: &str = "sys:";

/// The collection holding extension registration records. Exempt from
/// whole-database clears so registered extensions survive them.
pub(crate) const REGISTRY_COLLECTION: &str = "sys:registry";

/// Prefix of collections that hold extension-private rows.
pub const EXTENSION_PREFIX: &str = "ext:";

/// Whether a collection name is reserved for internal or extension use.
#[must_use]
pub fn is_reserved_collection(collection: &str) -> bool {
    collection.starts_with(SYSTEM_PREFIX) || collection.starts_with(EXTENSION_PREFIX)
}
