//! Commit and lifecycle notifications.

use crate::changeset::ChangeSet;
use karst_storage::StorePaths;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{mpsc, Arc};

/// Emitted once, after the database and every connection are gone.
#[derive(Debug, Clone)]
pub struct CloseEvent {
    /// The resolved locations that backed the database, so callers can
    /// archive or delete the files once nothing holds them open.
    pub paths: StorePaths,
}

/// One database lifecycle event, as delivered to channel subscribers.
#[derive(Debug, Clone)]
pub enum DatabaseEvent {
    /// A read-write commit modified the database. Delivered after every
    /// connection has applied or journaled the change set.
    Modified(Arc<ChangeSet>),
    /// The database closed.
    Closed(CloseEvent),
}

/// Observer callbacks for database events.
///
/// Implementations run on whichever thread finishes the commit or drops
/// the last database handle, so they should hand work off rather than
/// block.
pub trait EventSink: Send + Sync {
    /// Called once per modifying commit, after every connection has
    /// applied or journaled its change set.
    fn database_modified(&self, changes: &Arc<ChangeSet>) {
        let _ = changes;
    }

    /// Called once when the database closes.
    fn database_closed(&self, event: &CloseEvent) {
        let _ = event;
    }
}

/// Change sets awaiting delivery, keyed by snapshot.
///
/// Two threads can finish distinct commits near-simultaneously, and the
/// later snapshot may reach the hub first. A set is held until its
/// predecessor has been queued, and a single flusher drains the queue so
/// observers see commits in snapshot order.
struct PublishState {
    queued: u64,
    held: BTreeMap<u64, Arc<ChangeSet>>,
    ready: VecDeque<Arc<ChangeSet>>,
    flushing: bool,
}

/// Fans events out to sinks and channel subscribers.
pub(crate) struct EventHub {
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    subscribers: RwLock<Vec<mpsc::Sender<DatabaseEvent>>>,
    publish: Mutex<PublishState>,
}

impl EventHub {
    /// `initial` is the snapshot already committed when the database
    /// opened; the first delivered change set is `initial + 1`.
    pub(crate) fn new(initial: u64) -> Self {
        Self {
            sinks: RwLock::new(Vec::new()),
            subscribers: RwLock::new(Vec::new()),
            publish: Mutex::new(PublishState {
                queued: initial,
                held: BTreeMap::new(),
                ready: VecDeque::new(),
                flushing: false,
            }),
        }
    }

    pub(crate) fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.write().push(sink);
    }

    /// Opens a channel that receives every subsequent event. Dropped
    /// receivers are pruned on the next delivery.
    pub(crate) fn subscribe(&self) -> mpsc::Receiver<DatabaseEvent> {
        let (sender, receiver) = mpsc::channel();
        self.subscribers.write().push(sender);
        receiver
    }

    /// Delivers a completed change set, in snapshot order. A set whose
    /// predecessor has not been queued yet is held back, and only one
    /// thread flushes at a time so observers never see commits out of
    /// order. Sinks run with no hub lock held; a sink that triggers
    /// another commit enqueues it for the active flusher.
    pub(crate) fn notify_modified(&self, changes: &Arc<ChangeSet>) {
        let mut publish = self.publish.lock();
        let snapshot = changes.snapshot().value();
        if snapshot <= publish.queued {
            return;
        }
        publish.held.insert(snapshot, Arc::clone(changes));
        let state = &mut *publish;
        while let Some(next) = state.held.remove(&(state.queued + 1)) {
            state.queued += 1;
            state.ready.push_back(next);
        }
        if publish.flushing {
            return;
        }
        publish.flushing = true;

        loop {
            let Some(next) = publish.ready.pop_front() else {
                publish.flushing = false;
                return;
            };
            drop(publish);

            for sink in self.sinks.read().iter() {
                sink.database_modified(&next);
            }
            self.subscribers.write().retain(|subscriber| {
                subscriber
                    .send(DatabaseEvent::Modified(Arc::clone(&next)))
                    .is_ok()
            });

            publish = self.publish.lock();
        }
    }

    pub(crate) fn notify_closed(&self, event: &CloseEvent) {
        for sink in self.sinks.read().iter() {
            sink.database_closed(event);
        }
        self.subscribers
            .write()
            .retain(|subscriber| subscriber.send(DatabaseEvent::Closed(event.clone())).is_ok());
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("sinks", &self.sinks.read().len())
            .field("subscribers", &self.subscribers.read().len())
            .finish_non_exhaustive()
    }
}
