//! The database handle and the core state it shares with connections.

use crate::broadcast::Broadcast;
use crate::changeset::ChangeSet;
use crate::config::{Config, ConnectionConfig};
use crate::connection::{CommitOptions, Connection};
use crate::error::{CoreError, CoreResult};
use crate::events::{CloseEvent, DatabaseEvent, EventHub, EventSink};
use crate::extension::{
    drop_extension_tables, persist_record, persisted_record, remove_record,
    validate_extension_name, Extension, ExtensionRegistry, RegistrationRecord,
};
use crate::pool::HandlePool;
use crate::queue::{SerialQueue, WorkerPool};
use crate::serializers::{Deserializer, HookPlane, HookTable, PostSanitizer, Sanitizer, Serializer};
use crate::types::{ConnectionId, Snapshot};
use crate::writer::WriterSlot;
use karst_storage::{FileEngine, MemoryEngine, StoreEngine, StorePaths};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};
use tracing::{debug, info, warn};

/// State shared by the [`Database`] handle and every [`Connection`].
///
/// Dropped once the handle and all connections are gone, which is what
/// makes the close notification fire exactly once.
pub(crate) struct DatabaseCore {
    pub(crate) engine: Box<dyn StoreEngine>,
    /// Latest committed snapshot.
    pub(crate) snapshot: AtomicU64,
    pub(crate) writer: WriterSlot,
    pub(crate) pool: HandlePool,
    pub(crate) workers: Arc<WorkerPool>,
    pub(crate) broadcast: Broadcast,
    pub(crate) registry: ExtensionRegistry,
    pub(crate) connections: RwLock<Vec<(ConnectionId, Weak<Connection>)>>,
    pub(crate) next_connection_id: AtomicU64,
    /// Set after the first mutating commit has swept orphaned
    /// extension state; the sweep runs at most once per process run.
    pub(crate) orphan_scan_done: AtomicBool,
    /// Serializes registration requests database-wide, so register,
    /// unregister and their flush barrier run strictly in order.
    ext_queue: SerialQueue,
    hub: EventHub,
    hooks: RwLock<Arc<HookTable>>,
    paths: StorePaths,
    config: Config,
}

impl DatabaseCore {
    /// The hook table as of now. Transactions capture it once at start
    /// so hook replacement never changes a transaction midway.
    pub(crate) fn current_hooks(&self) -> Arc<HookTable> {
        Arc::clone(&self.hooks.read())
    }

    fn update_hooks(&self, f: impl FnOnce(&mut HookTable)) {
        let mut guard = self.hooks.write();
        let mut table = (**guard).clone();
        f(&mut table);
        *guard = Arc::new(table);
    }

    /// Delivers change sets whose last receiver just confirmed them,
    /// then lets the engine reclaim versions no connection can see.
    ///
    /// Callers must not hold any connection state lock; sinks run on
    /// this thread.
    pub(crate) fn finish_completed(&self, completed: Vec<Arc<ChangeSet>>) {
        if completed.is_empty() {
            return;
        }
        for changes in &completed {
            self.hub.notify_modified(changes);
        }
        let floor = self
            .broadcast
            .min_floor(self.snapshot.load(Ordering::Acquire));
        self.engine.compact(floor);
    }

    /// Queues catch-up turns on every live connection except `origin`,
    /// so idle connections adopt fresh commits promptly.
    pub(crate) fn nudge_others(&self, origin: ConnectionId) {
        let others: Vec<Weak<Connection>> = self
            .connections
            .read()
            .iter()
            .filter(|(id, _)| *id != origin)
            .map(|(_, connection)| Weak::clone(connection))
            .collect();
        for weak in others {
            if let Some(connection) = weak.upgrade() {
                connection.nudge();
            }
        }
    }
}

impl Drop for DatabaseCore {
    fn drop(&mut self) {
        debug!("database closed");
        self.hub.notify_closed(&CloseEvent {
            paths: self.paths.clone(),
        });
    }
}

/// An embedded, transactional key-value database.
///
/// A `Database` is a cheap handle over shared state; clone it freely.
/// All data access goes through [`Connection`]s created with
/// [`new_connection`](Self::new_connection). The database stays open
/// until the last handle and the last connection are dropped, at which
/// point a close event fires with the backing store's paths.
#[derive(Clone)]
pub struct Database {
    core: Arc<DatabaseCore>,
}

impl Database {
    /// Opens the database rooted at `path`, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or is
    /// already locked by another live database.
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        Self::open_with_config(path, Config::default())
    }

    /// Opens the database rooted at `path` with explicit tuning.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or is
    /// already locked by another live database.
    pub fn open_with_config(path: impl AsRef<Path>, config: Config) -> CoreResult<Self> {
        let engine = FileEngine::open(path)?;
        Self::open_with_engine(Box::new(engine), config)
    }

    /// Opens a fresh in-memory database that vanishes on close.
    ///
    /// # Errors
    ///
    /// Returns an error if worker threads cannot be spawned.
    pub fn open_in_memory() -> CoreResult<Self> {
        Self::open_in_memory_with_config(Config::default())
    }

    /// Opens an in-memory database with explicit tuning.
    ///
    /// # Errors
    ///
    /// Returns an error if worker threads cannot be spawned.
    pub fn open_in_memory_with_config(config: Config) -> CoreResult<Self> {
        Self::open_with_engine(Box::new(MemoryEngine::new()), config)
    }

    /// Opens a database over a caller-provided storage engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine refuses a handle or worker
    /// threads cannot be spawned.
    pub fn open_with_engine(engine: Box<dyn StoreEngine>, config: Config) -> CoreResult<Self> {
        let probe = engine.open_handle()?;
        let initial = probe.committed_snapshot();
        let paths = engine.paths();
        let pool = HandlePool::new(config.pool_capacity, config.pool_lifetime)?;
        pool.checkin(probe);
        let workers = Arc::new(WorkerPool::new(config.worker_threads)?);
        let ext_queue = SerialQueue::new(Arc::clone(&workers));
        debug!(snapshot = initial, "database opened");
        Ok(Self {
            core: Arc::new(DatabaseCore {
                engine,
                snapshot: AtomicU64::new(initial),
                writer: WriterSlot::new(),
                pool,
                workers,
                broadcast: Broadcast::new(),
                registry: ExtensionRegistry::new(),
                connections: RwLock::new(Vec::new()),
                next_connection_id: AtomicU64::new(1),
                orphan_scan_done: AtomicBool::new(false),
                ext_queue,
                hub: EventHub::new(initial),
                hooks: RwLock::new(Arc::new(HookTable::new())),
                paths,
                config,
            }),
        })
    }

    /// Creates a connection with this database's default settings, as
    /// configured via [`Config::connection_defaults`].
    ///
    /// # Errors
    ///
    /// Returns an error if the engine refuses a new storage handle.
    pub fn new_connection(&self) -> CoreResult<Arc<Connection>> {
        self.new_connection_with_config(self.core.config.connection_defaults)
    }

    /// Creates a connection with explicit cache settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine refuses a new storage handle.
    pub fn new_connection_with_config(
        &self,
        config: ConnectionConfig,
    ) -> CoreResult<Arc<Connection>> {
        Connection::create(&self.core, config)
    }

    /// The latest committed snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.core.snapshot.load(Ordering::Acquire))
    }

    /// The locations backing this database. Empty for in-memory stores.
    #[must_use]
    pub fn paths(&self) -> &StorePaths {
        &self.core.paths
    }

    /// The configuration this database was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.core.config
    }

    /// Replaces the serializer for `collection`, or the default one
    /// when `collection` is `None`.
    ///
    /// Transactions already running keep the hooks they started with.
    pub fn set_serializer(
        &self,
        collection: Option<&str>,
        plane: HookPlane,
        serializer: Serializer,
    ) {
        self.core
            .update_hooks(|hooks| hooks.set_serializer(collection, plane, serializer));
    }

    /// Replaces the deserializer for `collection`, or the default one
    /// when `collection` is `None`.
    pub fn set_deserializer(
        &self,
        collection: Option<&str>,
        plane: HookPlane,
        deserializer: Deserializer,
    ) {
        self.core
            .update_hooks(|hooks| hooks.set_deserializer(collection, plane, deserializer));
    }

    /// Installs a sanitizer that rewrites values before serialization.
    pub fn set_pre_sanitizer(
        &self,
        collection: Option<&str>,
        plane: HookPlane,
        sanitizer: Sanitizer,
    ) {
        self.core
            .update_hooks(|hooks| hooks.set_pre_sanitizer(collection, plane, sanitizer));
    }

    /// Installs an observer that sees the final value of every write
    /// once it is staged. Runs for side effects only.
    pub fn set_post_sanitizer(
        &self,
        collection: Option<&str>,
        plane: HookPlane,
        sanitizer: PostSanitizer,
    ) {
        self.core
            .update_hooks(|hooks| hooks.set_post_sanitizer(collection, plane, sanitizer));
    }

    /// Registers `extension` under `name` and brings its derived state
    /// up to date, all inside one read-write transaction.
    ///
    /// When a record with the same kind, version and config is already
    /// persisted from an earlier run, the existing state is kept as is
    /// and this returns `Ok(false)` without writing anything. Otherwise
    /// any previous state under the name is dropped, the record is
    /// persisted and [`Extension::populate`] rebuilds the state from
    /// scratch; the call returns `Ok(true)`.
    ///
    /// Registration requests from all threads run strictly in order.
    /// Once this returns, commits on every connection run the
    /// extension's [`process_commit`](Extension::process_commit).
    ///
    /// # Errors
    ///
    /// Returns the populate error, a commit failure,
    /// [`ExtensionNameTaken`](CoreError::ExtensionNameTaken) when a
    /// live extension already owns the name, or
    /// [`InvalidExtensionName`](CoreError::InvalidExtensionName) for an
    /// empty name or one containing `':'`. On error nothing is
    /// persisted and the extension is not registered.
    pub fn register_extension(
        &self,
        name: &str,
        extension: Arc<dyn Extension>,
    ) -> CoreResult<bool> {
        self.core
            .ext_queue
            .run_sync(|| self.register_inner(name, extension))?
    }

    /// Queues a registration behind every earlier registration request
    /// and reports the outcome to `completion` on a worker thread:
    /// `true` once the extension is ready, `false` on failure.
    pub fn register_extension_async(
        &self,
        name: impl Into<String>,
        extension: Arc<dyn Extension>,
        completion: impl FnOnce(bool) + Send + 'static,
    ) {
        let database = self.clone();
        let name = name.into();
        self.core.ext_queue.run_async(Box::new(move || {
            let result = database.register_inner(&name, extension);
            if let Err(error) = &result {
                warn!(extension = %name, error = %error, "asynchronous registration failed");
            }
            completion(result.is_ok());
        }));
    }

    fn register_inner(&self, name: &str, extension: Arc<dyn Extension>) -> CoreResult<bool> {
        validate_extension_name(name)?;
        if self.core.registry.get(name).is_some() {
            return Err(CoreError::ExtensionNameTaken {
                name: name.to_owned(),
            });
        }
        let record = RegistrationRecord::describe(extension.as_ref())?;
        let connection = self.new_connection()?;

        let core = Arc::clone(&self.core);
        let instance = Arc::clone(&extension);
        let owned_name = name.to_owned();
        let options = CommitOptions {
            skip_extension: Some(name),
            on_success: Some(Box::new(move || {
                core.registry.insert(&owned_name, instance);
            })),
        };

        connection.read_write_with(options, |txn| {
            let existing = match persisted_record(txn, name) {
                Ok(existing) => existing,
                Err(error) => {
                    warn!(
                        extension = %name,
                        error = %error,
                        "replacing undecodable registration record"
                    );
                    None
                }
            };
            match existing {
                Some(existing) if existing == record => {
                    debug!(extension = %name, "re-registered unchanged, keeping state");
                    Ok(false)
                }
                existing => {
                    if existing.is_some() {
                        info!(extension = %name, "registration changed, rebuilding state");
                    }
                    drop_extension_tables(txn, name)?;
                    persist_record(txn, name, &record)?;
                    extension.populate(name, txn)?;
                    Ok(true)
                }
            }
        })
    }

    /// Removes the extension registered under `name`, dropping its
    /// record and every table it owns in one read-write transaction.
    ///
    /// Returns `Ok(true)` if a persisted registration existed. Safe to
    /// call for names that were never registered, and for leftovers
    /// from a previous run whose instance no longer exists.
    ///
    /// # Errors
    ///
    /// Returns a commit failure or an invalid-name error.
    pub fn unregister_extension(&self, name: &str) -> CoreResult<bool> {
        self.core
            .ext_queue
            .run_sync(|| self.unregister_inner(name))?
    }

    /// Queues an unregistration behind every earlier registration
    /// request. `completion` runs on a worker thread and receives
    /// whether a persisted registration existed; failures report
    /// `false`.
    pub fn unregister_extension_async(
        &self,
        name: impl Into<String>,
        completion: impl FnOnce(bool) + Send + 'static,
    ) {
        let database = self.clone();
        let name = name.into();
        self.core.ext_queue.run_async(Box::new(move || {
            let result = database.unregister_inner(&name);
            if let Err(error) = &result {
                warn!(extension = %name, error = %error, "asynchronous unregistration failed");
            }
            completion(result.unwrap_or(false));
        }));
    }

    /// Runs `completion` on a worker thread once every registration
    /// request submitted before this call has settled. A FIFO barrier
    /// on the registration queue, not a poll.
    pub fn flush_extension_requests(&self, completion: impl FnOnce() + Send + 'static) {
        self.core.ext_queue.run_async(Box::new(completion));
    }

    fn unregister_inner(&self, name: &str) -> CoreResult<bool> {
        validate_extension_name(name)?;
        let connection = self.new_connection()?;

        let core = Arc::clone(&self.core);
        let owned_name = name.to_owned();
        let options = CommitOptions {
            skip_extension: Some(name),
            on_success: Some(Box::new(move || {
                core.registry.remove(&owned_name);
            })),
        };

        connection.read_write_with(options, |txn| {
            let existed = match persisted_record(txn, name) {
                Ok(record) => record.is_some(),
                Err(error) => {
                    warn!(
                        extension = %name,
                        error = %error,
                        "removing undecodable registration record"
                    );
                    true
                }
            };
            if existed {
                remove_record(txn, name);
            }
            drop_extension_tables(txn, name)?;
            Ok(existed)
        })
    }

    /// The extension registered under `name`, if any.
    #[must_use]
    pub fn extension(&self, name: &str) -> Option<Arc<dyn Extension>> {
        self.core.registry.get(name)
    }

    /// Names of the extensions registered in this process, in
    /// registration order.
    #[must_use]
    pub fn registered_extension_names(&self) -> Vec<String> {
        self.core.registry.names()
    }

    /// Adds an observer for commit and close events.
    pub fn add_event_sink(&self, sink: Arc<dyn EventSink>) {
        self.core.hub.add_sink(sink);
    }

    /// Subscribes a channel to commit and close events. The receiver
    /// is dropped from delivery once it disconnects.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::Receiver<DatabaseEvent> {
        self.core.hub.subscribe()
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("snapshot", &self.core.snapshot.load(Ordering::Relaxed))
            .field("paths", &self.core.paths)
            .finish_non_exhaustive()
    }
}
