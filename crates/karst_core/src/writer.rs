//! The single writer slot.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SLOT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Writer slots held by the current thread. Nested writes across
    /// different databases are fine; re-acquiring the same slot is not.
    static HELD_SLOTS: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

#[derive(Default)]
struct SlotState {
    next_ticket: u64,
    now_serving: u64,
}

/// Admits one read-write transaction at a time, in arrival order.
///
/// Waiters take a ticket and block until it comes up, so a stream of
/// writers cannot starve any one of them.
pub(crate) struct WriterSlot {
    id: u64,
    state: Mutex<SlotState>,
    turn: Condvar,
}

impl WriterSlot {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_SLOT_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(SlotState::default()),
            turn: Condvar::new(),
        }
    }

    /// Blocks until this caller holds the slot.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NestedWrite`] when the current thread
    /// already holds this slot; waiting would deadlock it against
    /// itself.
    pub(crate) fn acquire(&self) -> CoreResult<WriterGuard<'_>> {
        let held = HELD_SLOTS.with(|slots| slots.borrow().contains(&self.id));
        if held {
            return Err(CoreError::NestedWrite);
        }

        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        while state.now_serving != ticket {
            self.turn.wait(&mut state);
        }
        drop(state);

        HELD_SLOTS.with(|slots| slots.borrow_mut().push(self.id));
        Ok(WriterGuard { slot: self })
    }
}

impl std::fmt::Debug for WriterSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterSlot")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Exclusive hold on the writer slot; released on drop.
pub(crate) struct WriterGuard<'a> {
    slot: &'a WriterSlot,
}

impl Drop for WriterGuard<'_> {
    fn drop(&mut self) {
        HELD_SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            if let Some(position) = slots.iter().rposition(|id| *id == self.slot.id) {
                slots.remove(position);
            }
        });
        let mut state = self.slot.state.lock();
        state.now_serving += 1;
        self.slot.turn.notify_all();
    }
}
