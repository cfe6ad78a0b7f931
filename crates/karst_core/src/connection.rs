//! Connections: the per-thread doorway into the database.
//!
//! A connection owns a storage handle, two value caches and a serial
//! queue. Transactions submitted through one connection run strictly
//! one at a time in submission order; different connections run fully
//! in parallel against their own snapshots. Before each transaction
//! the connection folds in any change sets committed elsewhere, so it
//! always observes the newest snapshot it has been told about, and
//! never skips or repeats one.

use crate::cache::LruCache;
use crate::changeset::{ChangeSet, RowChange};
use crate::config::{CachePolicy, ConnectionConfig};
use crate::database::DatabaseCore;
use crate::error::{CoreError, CoreResult};
use crate::extension::{drop_extension_tables, persisted_names, remove_record};
use crate::queue::SerialQueue;
use crate::transaction::{ReadTransaction, ValueCache, WriteTransaction};
use crate::types::{ConnectionId, RowKey, Snapshot};
use karst_storage::StoreHandle;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Mutable half of a connection, guarded by one mutex.
struct ConnState {
    /// Surrendered to the reuse pool when the connection drops.
    handle: Option<Box<dyn StoreHandle>>,
    /// Snapshot this connection currently reads at.
    snapshot: u64,
    /// Highest change set snapshot received (applied or journaled).
    received: u64,
    /// While pinned, reads stay at this snapshot and incoming change
    /// sets go to the journal instead of the caches.
    pinned: Option<u64>,
    journal: VecDeque<Arc<ChangeSet>>,
    object_cache: RefCell<ValueCache>,
    metadata_cache: RefCell<ValueCache>,
}

/// Commit-driver knobs used by extension registration; everything
/// user-facing goes through the defaults.
#[derive(Default)]
pub(crate) struct CommitOptions<'a> {
    /// Extension left out of commit processing, because this very
    /// transaction is building or dismantling its state.
    pub(crate) skip_extension: Option<&'a str>,
    /// Runs once the transaction has succeeded (commit durable, or
    /// nothing staged), while the writer slot is still held.
    pub(crate) on_success: Option<Box<dyn FnOnce() + 'a>>,
}

/// A serialized access point to the database.
///
/// Connections are cheap enough to create per subsystem and are meant
/// to be long-lived; each caches deserialized rows and tracks its own
/// snapshot. All methods take `&self` and may be called from any
/// thread; the internal queue serializes the actual transactions.
pub struct Connection {
    id: ConnectionId,
    core: Arc<DatabaseCore>,
    queue: SerialQueue,
    config: ConnectionConfig,
    state: Mutex<ConnState>,
}

impl Connection {
    pub(crate) fn create(
        core: &Arc<DatabaseCore>,
        config: ConnectionConfig,
    ) -> CoreResult<Arc<Self>> {
        let handle = match core.pool.checkout() {
            Some(handle) => handle,
            None => core.engine.open_handle()?,
        };
        let id = ConnectionId::new(core.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let snapshot = core.snapshot.load(Ordering::Acquire);
        core.broadcast.register(id, snapshot);

        let connection = Arc::new(Self {
            id,
            core: Arc::clone(core),
            queue: SerialQueue::new(Arc::clone(&core.workers)),
            config,
            state: Mutex::new(ConnState {
                handle: Some(handle),
                snapshot,
                received: snapshot,
                pinned: None,
                journal: VecDeque::new(),
                object_cache: RefCell::new(build_cache(
                    config.object_cache_enabled,
                    config.object_cache_limit,
                )),
                metadata_cache: RefCell::new(build_cache(
                    config.metadata_cache_enabled,
                    config.metadata_cache_limit,
                )),
            }),
        });
        core.connections
            .write()
            .push((id, Arc::downgrade(&connection)));
        debug!(connection = %id, snapshot, "connection opened");
        Ok(connection)
    }

    /// This connection's identifier, as it appears in change sets.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The snapshot the connection's last transaction observed.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::new(self.state.lock().snapshot)
    }

    /// The snapshot this connection is pinned to, if any.
    #[must_use]
    pub fn pinned_snapshot(&self) -> Option<Snapshot> {
        self.state.lock().pinned.map(Snapshot::new)
    }

    /// Runs a read transaction, blocking until earlier submissions on
    /// this connection have finished.
    ///
    /// # Errors
    ///
    /// Returns an error when called from inside another transaction on
    /// this connection.
    pub fn read<R>(&self, f: impl FnOnce(&ReadTransaction<'_>) -> R) -> CoreResult<R> {
        let (result, completed) = self.queue.run_sync(|| self.read_inner(f))??;
        self.core.finish_completed(completed);
        Ok(result)
    }

    /// Queues a read transaction to run on the worker pool, after
    /// earlier submissions on this connection.
    pub fn read_async(self: &Arc<Self>, f: impl FnOnce(&ReadTransaction<'_>) + Send + 'static) {
        let weak = Arc::downgrade(self);
        self.queue.run_async(Box::new(move || {
            let Some(connection) = weak.upgrade() else {
                return;
            };
            match connection.read_inner(f) {
                Ok(((), completed)) => connection.core.finish_completed(completed),
                Err(err) => {
                    warn!(connection = %connection.id, error = %err, "asynchronous read failed");
                }
            }
        }));
    }

    /// Runs a read-write transaction and commits it when the closure
    /// returns `Ok` without having called
    /// [`rollback`](WriteTransaction::rollback). A closure error or an
    /// explicit rollback discards every staged write.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, a commit failure (after rolling
    /// back), [`CoreError::WritePinned`] on a pinned connection, or a
    /// re-entrancy error.
    pub fn read_write<R>(
        &self,
        f: impl FnOnce(&mut WriteTransaction<'_>) -> CoreResult<R>,
    ) -> CoreResult<R> {
        self.read_write_with(CommitOptions::default(), f)
    }

    /// Queues a read-write transaction to run on the worker pool, after
    /// earlier submissions on this connection. Failures are logged.
    pub fn read_write_async(
        self: &Arc<Self>,
        f: impl FnOnce(&mut WriteTransaction<'_>) -> CoreResult<()> + Send + 'static,
    ) {
        let id = self.id;
        self.read_write_async_with(f, move |result| {
            if let Err(error) = result {
                warn!(connection = %id, error = %error, "asynchronous write failed");
            }
        });
    }

    /// Queues a read-write transaction and hands the outcome to
    /// `completion`, which runs on the worker thread once the commit
    /// has fully settled or failed.
    pub fn read_write_async_with(
        self: &Arc<Self>,
        f: impl FnOnce(&mut WriteTransaction<'_>) -> CoreResult<()> + Send + 'static,
        completion: impl FnOnce(CoreResult<()>) + Send + 'static,
    ) {
        let weak = Arc::downgrade(self);
        self.queue.run_async(Box::new(move || {
            let Some(connection) = weak.upgrade() else {
                return;
            };
            match connection.write_inner(CommitOptions::default(), f) {
                Ok(((), completed, modified)) => {
                    connection.finish_write(completed, modified);
                    completion(Ok(()));
                }
                Err(error) => completion(Err(error)),
            }
        }));
    }

    pub(crate) fn read_write_with<R>(
        &self,
        options: CommitOptions<'_>,
        f: impl FnOnce(&mut WriteTransaction<'_>) -> CoreResult<R>,
    ) -> CoreResult<R> {
        let (result, completed, modified) =
            self.queue.run_sync(|| self.write_inner(options, f))??;
        self.finish_write(completed, modified);
        Ok(result)
    }

    /// Blocks until every transaction submitted to this connection
    /// before this call has finished.
    ///
    /// # Errors
    ///
    /// Returns an error when called from inside a transaction on this
    /// connection.
    pub fn flush(&self) -> CoreResult<()> {
        self.queue.barrier()
    }

    /// Catches the connection up to the newest committed snapshot and
    /// freezes its view there.
    ///
    /// While pinned, reads keep observing the pinned snapshot; change
    /// sets committed elsewhere are journaled instead of applied, so
    /// they are never lost and other observers are never held up.
    /// Returns the change sets folded in while catching up, in snapshot
    /// order. Pinning an already pinned connection jumps the view to
    /// the newest snapshot: the journal is replayed first and rides
    /// along in the returned list.
    ///
    /// # Errors
    ///
    /// Returns an error when called from inside a transaction on this
    /// connection.
    pub fn pin_snapshot(&self) -> CoreResult<Vec<Arc<ChangeSet>>> {
        let (applied, completed) = self.queue.run_sync(|| {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut applied = Vec::new();
            let mut completed = Vec::new();

            while let Some(changes) = state.journal.pop_front() {
                self.apply_changeset(state, &changes, false);
                state.snapshot = changes.snapshot().value();
                applied.push(changes);
            }
            for changes in self.core.broadcast.changes_after(state.received) {
                let snapshot = changes.snapshot().value();
                self.apply_changeset(state, &changes, false);
                state.snapshot = snapshot;
                state.received = snapshot;
                completed.extend(self.core.broadcast.acknowledge(self.id, snapshot, snapshot));
                applied.push(changes);
            }
            // Journaled sets were acknowledged as they arrived; this
            // re-anchors the compaction floor at the live view
            completed.extend(
                self.core
                    .broadcast
                    .acknowledge(self.id, state.received, state.snapshot),
            );
            state.pinned = Some(state.snapshot);
            (applied, completed)
        })?;
        self.core.finish_completed(completed);
        Ok(applied)
    }

    /// Releases a pin, replaying the journal so the connection catches
    /// up to the newest received snapshot. A no-op when not pinned.
    ///
    /// # Errors
    ///
    /// Returns an error when called from inside a transaction on this
    /// connection.
    pub fn unpin_snapshot(&self) -> CoreResult<()> {
        let completed = self.queue.run_sync(|| {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.pinned.take().is_none() {
                return Vec::new();
            }
            while let Some(changes) = state.journal.pop_front() {
                self.apply_changeset(state, &changes, false);
                state.snapshot = changes.snapshot().value();
            }
            // Journaled sets were acknowledged as they arrived; this
            // only raises the compaction floor back to the live view.
            self.core
                .broadcast
                .acknowledge(self.id, state.received, state.snapshot)
        })?;
        self.core.finish_completed(completed);
        Ok(())
    }

    /// Queues a catch-up turn so this connection adopts freshly
    /// committed change sets even while otherwise idle.
    pub(crate) fn nudge(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.queue.run_async(Box::new(move || {
            let Some(connection) = weak.upgrade() else {
                return;
            };
            let completed = {
                let mut guard = connection.state.lock();
                connection.apply_pending(&mut guard)
            };
            connection.core.finish_completed(completed);
        }));
    }

    fn read_inner<R>(
        &self,
        f: impl FnOnce(&ReadTransaction<'_>) -> R,
    ) -> CoreResult<(R, Vec<Arc<ChangeSet>>)> {
        let hooks = self.core.current_hooks();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let completed = self.apply_pending(state);

        let Some(handle) = state.handle.as_ref() else {
            return Err(CoreError::Closed);
        };
        let txn = ReadTransaction::new(
            handle.as_ref(),
            Snapshot::new(state.snapshot),
            &hooks,
            &state.object_cache,
            &state.metadata_cache,
        );
        let result = f(&txn);
        Ok((result, completed))
    }

    /// The commit driver. Runs on this connection's queue turn.
    fn write_inner<R>(
        &self,
        options: CommitOptions<'_>,
        f: impl FnOnce(&mut WriteTransaction<'_>) -> CoreResult<R>,
    ) -> CoreResult<(R, Vec<Arc<ChangeSet>>, bool)> {
        // Pins are owned by this queue, so the flag cannot change
        // between this check and the transaction below.
        {
            let state = self.state.lock();
            if let Some(snapshot) = state.pinned {
                return Err(CoreError::WritePinned { snapshot });
            }
        }

        let core = &self.core;
        let slot = core.writer.acquire()?;
        let hooks = core.current_hooks();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        // Catch up to the tip; with the writer slot held it cannot move
        let mut completed = self.apply_pending(state);
        let tip = state.snapshot;

        let Some(handle) = state.handle.as_mut() else {
            return Err(CoreError::Closed);
        };
        let mut txn = WriteTransaction::new(
            handle.as_mut(),
            Snapshot::new(tip),
            &hooks,
            &state.object_cache,
            &state.metadata_cache,
        );

        let result = match f(&mut txn) {
            Ok(result) => result,
            Err(error) => {
                txn.rollback();
                return Err(error);
            }
        };
        if txn.is_rolled_back() {
            return Ok((result, completed, false));
        }

        // Extensions fold the commit into their derived state; any
        // failure aborts the whole commit
        let mut deltas = BTreeMap::new();
        let extensions = core.registry.entries();
        if !extensions.is_empty() {
            let changes = txn.commit_changes();
            for (name, extension) in extensions {
                if options.skip_extension == Some(name.as_str()) {
                    continue;
                }
                match extension.process_commit(&name, &mut txn, &changes) {
                    Ok(Some(delta)) => {
                        deltas.insert(name, delta);
                    }
                    Ok(None) => {}
                    Err(error) => {
                        txn.rollback();
                        return Err(error);
                    }
                }
            }
        }

        // The first mutating commit of a run sweeps out state left by
        // extensions that were never re-registered
        let mut swept = false;
        if !core.orphan_scan_done.load(Ordering::Acquire) && txn.staged_len() > 0 {
            if let Err(error) = self.sweep_orphans(&mut txn, options.skip_extension) {
                txn.rollback();
                return Err(error);
            }
            swept = true;
        }

        let staged = txn.staged_len();
        let (recorder, _) = txn.into_parts();

        if staged == 0 {
            // Nothing changed; the snapshot does not advance
            if let Some(on_success) = options.on_success {
                on_success();
            }
            return Ok((result, completed, false));
        }

        let new_snapshot = tip + 1;
        if let Err(error) = handle.commit(new_snapshot) {
            handle.rollback();
            return Err(error.into());
        }
        core.snapshot.store(new_snapshot, Ordering::Release);
        if swept {
            core.orphan_scan_done.store(true, Ordering::Release);
        }

        let changes = Arc::new(recorder.finish(Snapshot::new(new_snapshot), self.id, deltas));
        trace!(connection = %self.id, snapshot = new_snapshot, staged, "commit published");
        completed.extend(core.broadcast.publish(Arc::clone(&changes)));

        // Adopt our own commit and acknowledge it
        self.apply_changeset(state, &changes, true);
        state.snapshot = new_snapshot;
        state.received = new_snapshot;
        completed.extend(
            core.broadcast
                .acknowledge(self.id, new_snapshot, new_snapshot),
        );

        if let Some(on_success) = options.on_success {
            on_success();
        }
        drop(guard);
        drop(slot);
        Ok((result, completed, true))
    }

    /// Post-commit work that must not run on the queue turn: waking the
    /// other connections and delivering completed notifications.
    fn finish_write(&self, completed: Vec<Arc<ChangeSet>>, modified: bool) {
        if modified {
            self.core.nudge_others(self.id);
        }
        self.core.finish_completed(completed);
    }

    /// Removes registry records and tables of extensions that are not
    /// registered in this process.
    fn sweep_orphans(
        &self,
        txn: &mut WriteTransaction<'_>,
        skip: Option<&str>,
    ) -> CoreResult<()> {
        let registered: HashSet<String> = self.core.registry.names().into_iter().collect();
        for name in persisted_names(txn) {
            if registered.contains(&name) || skip == Some(name.as_str()) {
                continue;
            }
            warn!(extension = %name, "removing state of unregistered extension");
            remove_record(txn, &name);
            drop_extension_tables(txn, &name)?;
        }
        Ok(())
    }

    /// Folds every change set this connection has not yet received into
    /// its view, journaling instead while pinned. Returns change sets
    /// whose delivery this connection was the last holdout for.
    fn apply_pending(&self, state: &mut ConnState) -> Vec<Arc<ChangeSet>> {
        let sets = self.core.broadcast.changes_after(state.received);
        let mut completed = Vec::new();
        for changes in sets {
            let snapshot = changes.snapshot().value();
            if let Some(pinned) = state.pinned {
                state.journal.push_back(Arc::clone(&changes));
                state.received = snapshot;
                completed.extend(self.core.broadcast.acknowledge(self.id, snapshot, pinned));
            } else {
                self.apply_changeset(state, &changes, false);
                state.snapshot = snapshot;
                state.received = snapshot;
                completed.extend(
                    self.core.broadcast.acknowledge(self.id, snapshot, snapshot),
                );
            }
        }
        completed
    }

    /// Folds one change set into the caches. `own` marks the commit
    /// this connection produced: its caches adopt the written values
    /// outright, while foreign commits go through the configured
    /// policies.
    fn apply_changeset(&self, state: &ConnState, changes: &ChangeSet, own: bool) {
        let mut objects = state.object_cache.borrow_mut();
        let mut metadata = state.metadata_cache.borrow_mut();

        if changes.did_remove_all() {
            objects.clear();
            metadata.clear();
        } else {
            for collection in changes.removed_collections() {
                objects.retain(|key| key.collection != collection);
                metadata.retain(|key| key.collection != collection);
            }
        }

        apply_plane(
            &mut objects,
            changes.object_changes(),
            own,
            self.config.object_policy,
        );
        apply_plane(
            &mut metadata,
            changes.metadata_changes(),
            own,
            self.config.metadata_policy,
        );
    }
}

fn apply_plane<'a>(
    cache: &mut ValueCache,
    changes: impl Iterator<Item = (&'a RowKey, &'a RowChange)>,
    own: bool,
    policy: CachePolicy,
) {
    for (key, change) in changes {
        if own {
            // Both updates and removals are knowledge worth keeping
            let value = match change {
                RowChange::Updated(value) => Some(Arc::clone(value)),
                RowChange::Removed => None,
            };
            cache.insert(key.clone(), value);
            continue;
        }
        match (policy, change) {
            (CachePolicy::Identity, RowChange::Updated(value)) => {
                cache.insert(key.clone(), Some(Arc::clone(value)));
            }
            (CachePolicy::Identity, RowChange::Removed) | (CachePolicy::Containment, _) => {
                cache.remove(key);
            }
        }
    }
}

fn build_cache(enabled: bool, limit: usize) -> ValueCache {
    if enabled {
        LruCache::new(limit)
    } else {
        LruCache::disabled()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(handle) = state.handle.take() {
            self.core.pool.checkin(handle);
        }
        state.journal.clear();
        let completed = self.core.broadcast.unregister(self.id);
        self.core
            .connections
            .write()
            .retain(|(id, _)| *id != self.id);
        debug!(connection = %self.id, "connection closed");
        self.core.finish_completed(completed);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("snapshot", &state.snapshot)
            .field("pinned", &state.pinned)
            .finish_non_exhaustive()
    }
}
