//! Change set distribution and notification gating.
//!
//! Every modifying commit publishes its [`ChangeSet`] here. The set is
//! retained until each registered connection has either applied it or
//! journaled it (for pinned connections); only then is it released for
//! external notification, in snapshot order. The tracker also remembers
//! the oldest snapshot any connection may still read, which bounds
//! storage compaction.

use crate::changeset::ChangeSet;
use crate::types::ConnectionId;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

struct PendingEntry {
    changes: Arc<ChangeSet>,
    /// Connections that have not yet applied or journaled this set.
    waiting: HashSet<ConnectionId>,
}

#[derive(Default)]
struct BroadcastState {
    /// Published change sets in snapshot order, retained until every
    /// connection has received them.
    pending: VecDeque<PendingEntry>,
    /// Minimum snapshot each connection may still read.
    floors: HashMap<ConnectionId, u64>,
}

#[derive(Default)]
pub(crate) struct Broadcast {
    state: Mutex<BroadcastState>,
}

impl Broadcast {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a connection. New connections start at the current tip, so
    /// they are never enrolled in change sets already pending.
    pub(crate) fn register(&self, id: ConnectionId, snapshot: u64) {
        self.state.lock().floors.insert(id, snapshot);
    }

    /// Removes a connection, releasing any change sets that were only
    /// waiting on it. Returned sets are ready for external notification.
    #[must_use]
    pub(crate) fn unregister(&self, id: ConnectionId) -> Vec<Arc<ChangeSet>> {
        let mut state = self.state.lock();
        state.floors.remove(&id);
        for entry in &mut state.pending {
            entry.waiting.remove(&id);
        }
        Self::take_complete(&mut state)
    }

    /// Publishes a freshly committed change set to every registered
    /// connection. Must be called in snapshot order.
    #[must_use]
    pub(crate) fn publish(&self, changes: Arc<ChangeSet>) -> Vec<Arc<ChangeSet>> {
        let mut state = self.state.lock();
        let waiting: HashSet<ConnectionId> = state.floors.keys().copied().collect();
        state.pending.push_back(PendingEntry { changes, waiting });
        Self::take_complete(&mut state)
    }

    /// Records that a connection has received every change set up to and
    /// including `received`, and now reads no older than `floor`.
    /// Returned sets are ready for external notification.
    #[must_use]
    pub(crate) fn acknowledge(
        &self,
        id: ConnectionId,
        received: u64,
        floor: u64,
    ) -> Vec<Arc<ChangeSet>> {
        let mut state = self.state.lock();
        for entry in &mut state.pending {
            if entry.changes.snapshot().value() <= received {
                entry.waiting.remove(&id);
            }
        }
        if state.floors.contains_key(&id) {
            state.floors.insert(id, floor);
        }
        Self::take_complete(&mut state)
    }

    /// The pending change sets newer than `after`, in snapshot order.
    pub(crate) fn changes_after(&self, after: u64) -> Vec<Arc<ChangeSet>> {
        self.state
            .lock()
            .pending
            .iter()
            .filter(|entry| entry.changes.snapshot().value() > after)
            .map(|entry| Arc::clone(&entry.changes))
            .collect()
    }

    /// The oldest snapshot any connection may still read, or `tip` when
    /// no connection is registered.
    pub(crate) fn min_floor(&self, tip: u64) -> u64 {
        self.state
            .lock()
            .floors
            .values()
            .copied()
            .min()
            .unwrap_or(tip)
    }

    fn take_complete(state: &mut BroadcastState) -> Vec<Arc<ChangeSet>> {
        let mut complete = Vec::new();
        while state
            .pending
            .front()
            .is_some_and(|entry| entry.waiting.is_empty())
        {
            if let Some(entry) = state.pending.pop_front() {
                complete.push(entry.changes);
            }
        }
        complete
    }
}

impl std::fmt::Debug for Broadcast {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Broadcast")
            .field("pending", &state.pending.len())
            .field("connections", &state.floors.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::ChangeRecorder;
    use crate::types::{RowKey, Snapshot};
    use karst_codec::Value;
    use std::collections::BTreeMap;

    fn change_set(snapshot: u64) -> Arc<ChangeSet> {
        let mut recorder = ChangeRecorder::new();
        recorder.record_put(
            RowKey::new("notes", "a"),
            Arc::new(Value::Integer(snapshot as i64)),
            None,
            true,
        );
        Arc::new(recorder.finish(
            Snapshot::new(snapshot),
            ConnectionId::new(0),
            BTreeMap::new(),
        ))
    }

    #[test]
    fn notification_waits_for_every_connection() {
        let broadcast = Broadcast::new();
        let a = ConnectionId::new(1);
        let b = ConnectionId::new(2);
        broadcast.register(a, 0);
        broadcast.register(b, 0);

        assert!(broadcast.publish(change_set(1)).is_empty());
        assert!(broadcast.acknowledge(a, 1, 1).is_empty());

        let complete = broadcast.acknowledge(b, 1, 1);
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].snapshot(), Snapshot::new(1));
    }

    #[test]
    fn completion_is_released_in_snapshot_order() {
        let broadcast = Broadcast::new();
        let a = ConnectionId::new(1);
        let b = ConnectionId::new(2);
        broadcast.register(a, 0);
        broadcast.register(b, 0);

        assert!(broadcast.publish(change_set(1)).is_empty());
        assert!(broadcast.publish(change_set(2)).is_empty());

        // b receives both, a receives only the second... which cannot
        // happen through connections (they apply in order), but the
        // tracker still refuses to release set 2 before set 1.
        assert!(broadcast.acknowledge(b, 2, 2).is_empty());
        let complete = broadcast.acknowledge(a, 2, 2);
        assert_eq!(complete.len(), 2);
        assert_eq!(complete[0].snapshot(), Snapshot::new(1));
        assert_eq!(complete[1].snapshot(), Snapshot::new(2));
    }

    #[test]
    fn unregister_releases_blocked_sets() {
        let broadcast = Broadcast::new();
        let a = ConnectionId::new(1);
        let b = ConnectionId::new(2);
        broadcast.register(a, 0);
        broadcast.register(b, 0);

        assert!(broadcast.publish(change_set(1)).is_empty());
        assert!(broadcast.acknowledge(a, 1, 1).is_empty());

        let complete = broadcast.unregister(b);
        assert_eq!(complete.len(), 1);
    }

    #[test]
    fn changes_after_filters_by_snapshot() {
        let broadcast = Broadcast::new();
        let a = ConnectionId::new(1);
        let b = ConnectionId::new(2);
        broadcast.register(a, 0);
        broadcast.register(b, 0);
        let _ = broadcast.publish(change_set(1));
        let _ = broadcast.publish(change_set(2));

        let missing = broadcast.changes_after(1);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].snapshot(), Snapshot::new(2));
        assert_eq!(broadcast.changes_after(2).len(), 0);
    }

    #[test]
    fn min_floor_tracks_laggards() {
        let broadcast = Broadcast::new();
        let a = ConnectionId::new(1);
        let b = ConnectionId::new(2);
        broadcast.register(a, 5);
        broadcast.register(b, 5);
        assert_eq!(broadcast.min_floor(9), 5);

        let _ = broadcast.acknowledge(a, 7, 7);
        assert_eq!(broadcast.min_floor(9), 5);
        let _ = broadcast.acknowledge(b, 7, 3);
        assert_eq!(broadcast.min_floor(9), 3);

        let _ = broadcast.unregister(a);
        let _ = broadcast.unregister(b);
        assert_eq!(broadcast.min_floor(9), 9);
    }
}
