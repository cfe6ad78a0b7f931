//! Reuse pool for idle storage handles.
//!
//! Opening a storage handle is not free, so handles released by dropped
//! connections are parked here and handed to the next connection. The
//! pool is bounded, reuses the most recently parked handle first, and a
//! background reaper closes handles that sit idle past their lifetime.

use karst_storage::StoreHandle;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct PoolState {
    /// Parked handles, oldest first.
    idle: Vec<(Box<dyn StoreHandle>, Instant)>,
    shutdown: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    wake: Condvar,
    capacity: usize,
    lifetime: Duration,
}

pub(crate) struct HandlePool {
    inner: Arc<PoolInner>,
    reaper: Option<thread::JoinHandle<()>>,
}

impl HandlePool {
    /// Creates a pool holding at most `capacity` idle handles, each for
    /// at most `lifetime`. A capacity of zero disables pooling; a zero
    /// lifetime disables eviction.
    pub(crate) fn new(capacity: usize, lifetime: Duration) -> std::io::Result<Self> {
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                shutdown: false,
            }),
            wake: Condvar::new(),
            capacity,
            lifetime,
        });

        let reaper = if capacity > 0 && !lifetime.is_zero() {
            let inner = Arc::clone(&inner);
            Some(
                thread::Builder::new()
                    .name("karst-pool-reaper".to_string())
                    .spawn(move || PoolInner::reap(&inner))?,
            )
        } else {
            None
        };

        Ok(Self { inner, reaper })
    }

    /// Takes the most recently parked handle, if any.
    pub(crate) fn checkout(&self) -> Option<Box<dyn StoreHandle>> {
        self.inner.state.lock().idle.pop().map(|(handle, _)| handle)
    }

    /// Parks a handle for reuse, or closes it when the pool is full or
    /// disabled. Any staged writes left on the handle are discarded.
    pub(crate) fn checkin(&self, mut handle: Box<dyn StoreHandle>) {
        handle.rollback();
        if self.inner.capacity == 0 {
            return;
        }
        let mut state = self.inner.state.lock();
        if state.shutdown || state.idle.len() >= self.inner.capacity {
            return;
        }
        state.idle.push((handle, Instant::now()));
        drop(state);
        self.inner.wake.notify_one();
    }

    #[cfg(test)]
    pub(crate) fn idle_len(&self) -> usize {
        self.inner.state.lock().idle.len()
    }
}

impl Drop for HandlePool {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.shutdown = true;
            state.idle.clear();
        }
        self.inner.wake.notify_all();
        if let Some(reaper) = self.reaper.take() {
            let _ = reaper.join();
        }
    }
}

impl std::fmt::Debug for HandlePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlePool")
            .field("capacity", &self.inner.capacity)
            .field("lifetime", &self.inner.lifetime)
            .finish_non_exhaustive()
    }
}

impl PoolInner {
    fn reap(inner: &Arc<PoolInner>) {
        let mut state = inner.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            match state.idle.first().map(|(_, parked)| *parked + inner.lifetime) {
                None => inner.wake.wait(&mut state),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let cutoff = now - inner.lifetime;
                        state.idle.retain(|(_, parked)| *parked > cutoff);
                    } else {
                        let _ = inner.wake.wait_until(&mut state, deadline);
                    }
                }
            }
        }
    }
}
