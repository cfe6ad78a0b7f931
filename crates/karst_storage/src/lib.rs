//! Storage engines for the karst database core.
//!
//! A [`StoreEngine`] owns the rows of one database and hands out
//! [`StoreHandle`]s, one per connection. Handles read at explicit
//! snapshots and stage writes locally until `commit` publishes them
//! atomically under the next snapshot number.
//!
//! Two engines ship: [`MemoryEngine`] keeps everything in process
//! memory, [`FileEngine`] persists batches to an append-only change
//! log inside a locked directory.
//!
//! ```
//! use karst_storage::{MemoryEngine, StoreEngine, StoredRow};
//!
//! let engine = MemoryEngine::new();
//! let mut handle = engine.open_handle()?;
//! handle.stage_put("notes", "a", StoredRow::new(b"hello".to_vec()));
//! handle.commit(1)?;
//! assert!(handle.get("notes", "a", 1).is_some());
//! # Ok::<(), karst_storage::StorageError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod engine;
mod error;
mod file;
mod log;
mod memory;
mod row;

pub use engine::{StoreEngine, StoreHandle};
pub use error::{StorageError, StorageResult};
pub use file::FileEngine;
pub use memory::MemoryEngine;
pub use row::{StorePaths, StoredRow};
