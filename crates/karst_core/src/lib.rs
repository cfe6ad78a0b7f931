//! # Karst Core
//!
//! The concurrent database core of karstdb.
//!
//! This crate provides:
//! - Snapshot-isolated read and read-write transactions over a
//!   pluggable storage engine
//! - Per-connection serial queues with synchronous and asynchronous
//!   submission
//! - Change-set broadcast that keeps every connection's view and
//!   caches current without blocking readers
//! - A transactional extension protocol for derived state such as
//!   secondary indexes
//! - Commit and close event delivery in commit order
//!
//! ## Example
//!
//! ```rust
//! use karst_core::{Database, Value};
//!
//! let database = Database::open_in_memory()?;
//! let connection = database.new_connection()?;
//!
//! connection.read_write(|txn| txn.put("books", "dune", Value::from("herbert")))?;
//!
//! let title = connection.read(|txn| txn.get("books", "dune"))?;
//! assert_eq!(title.as_deref().and_then(Value::as_text), Some("herbert"));
//! # Ok::<(), karst_core::CoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod broadcast;
mod cache;
mod changeset;
mod config;
mod connection;
mod database;
mod error;
mod events;
mod extension;
mod pool;
mod queue;
mod serializers;
mod transaction;
mod types;
mod writer;

pub use changeset::{ChangeSet, CommitChanges, RowChange};
pub use config::{
    CachePolicy, Config, ConnectionConfig, DEFAULT_METADATA_CACHE_LIMIT,
    DEFAULT_OBJECT_CACHE_LIMIT, DEFAULT_POOL_CAPACITY, DEFAULT_POOL_LIFETIME,
    DEFAULT_WORKER_THREADS,
};
pub use connection::Connection;
pub use database::Database;
pub use error::{CoreError, CoreResult};
pub use events::{CloseEvent, DatabaseEvent, EventSink};
pub use extension::{extension_table, Extension, ValueIndex};
pub use serializers::{Deserializer, HookPlane, PostSanitizer, Sanitizer, Serializer};
pub use transaction::{ReadTransaction, WriteTransaction};
pub use types::{
    is_reserved_collection, ConnectionId, RowKey, Snapshot, EXTENSION_PREFIX, SYSTEM_PREFIX,
};

pub use karst_codec::{CodecError, Value};
pub use karst_storage::{
    StorageError, StorageResult, StoreEngine, StoreHandle, StorePaths, StoredRow,
};
