//! Serial execution queues over a shared worker pool.
//!
//! Every connection owns a [`SerialQueue`]. Work arrives either
//! synchronously (the caller blocks until its turn, then runs inline)
//! or asynchronously (the job runs on a pool worker). Tickets are
//! issued at submission, and jobs run strictly in ticket order, so a
//! connection's transactions execute one at a time in the order they
//! were requested regardless of how they were submitted.

use crate::error::{CoreError, CoreResult};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

pub(crate) type Job = Box<dyn FnOnce() + Send>;

/// Fixed set of threads that run asynchronous transactions.
pub(crate) struct WorkerPool {
    sender: Option<mpsc::Sender<Job>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `count` workers (at least one).
    pub(crate) fn new(count: usize) -> std::io::Result<Self> {
        let count = count.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let receiver = Arc::clone(&receiver);
            let worker = thread::Builder::new()
                .name(format!("karst-worker-{index}"))
                .spawn(move || loop {
                    // The guard is released before the job runs
                    let job = receiver.lock().recv();
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })?;
            workers.push(worker);
        }
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Hands a job to the pool. Jobs submitted during shutdown are
    /// dropped.
    pub(crate) fn submit(&self, job: Job) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(job);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // The pool can be dropped from a worker when the last
            // database handle dies inside an asynchronous job; that
            // worker cannot join itself.
            if worker.thread().id() == current {
                continue;
            }
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Queues whose jobs are running on this thread, innermost last.
    static ACTIVE_QUEUES: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Pops the queue id when a job finishes, panic or not.
struct QueueMark {
    id: u64,
}

impl QueueMark {
    fn enter(id: u64) -> Self {
        ACTIVE_QUEUES.with(|stack| stack.borrow_mut().push(id));
        Self { id }
    }
}

impl Drop for QueueMark {
    fn drop(&mut self) {
        ACTIVE_QUEUES.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(position) = stack.iter().rposition(|id| *id == self.id) {
                stack.remove(position);
            }
        });
    }
}

#[derive(Default)]
struct QueueState {
    next_ticket: u64,
    now_serving: u64,
    /// Asynchronous jobs waiting for their ticket, keyed by ticket.
    pending: BTreeMap<u64, Job>,
    /// Whether a drain task is active on the pool.
    draining: bool,
}

struct QueueInner {
    id: u64,
    pool: Arc<WorkerPool>,
    state: Mutex<QueueState>,
    turn: Condvar,
}

/// A strict FIFO executor bound to one connection.
#[derive(Clone)]
pub(crate) struct SerialQueue {
    inner: Arc<QueueInner>,
}

impl SerialQueue {
    pub(crate) fn new(pool: Arc<WorkerPool>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                id: NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed),
                pool,
                state: Mutex::new(QueueState::default()),
                turn: Condvar::new(),
            }),
        }
    }

    /// Runs `job` inline once every earlier submission has finished.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Reentrant`] when called from a job already
    /// running on this queue, which would otherwise deadlock.
    pub(crate) fn run_sync<R>(&self, job: impl FnOnce() -> R) -> CoreResult<R> {
        let reentrant =
            ACTIVE_QUEUES.with(|stack| stack.borrow().contains(&self.inner.id));
        if reentrant {
            return Err(CoreError::reentrant(
                "transaction started inside a transaction on the same connection",
            ));
        }

        let mut state = self.inner.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        while state.now_serving != ticket {
            self.inner.turn.wait(&mut state);
        }
        drop(state);

        let result = {
            let _mark = QueueMark::enter(self.inner.id);
            job()
        };

        let mut state = self.inner.state.lock();
        state.now_serving += 1;
        self.maybe_spawn_drain(&mut state);
        self.inner.turn.notify_all();
        drop(state);
        Ok(result)
    }

    /// Queues `job` to run on the worker pool in submission order.
    pub(crate) fn run_async(&self, job: Job) {
        let mut state = self.inner.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.pending.insert(ticket, job);
        self.maybe_spawn_drain(&mut state);
    }

    /// Blocks until every job submitted before this call has finished.
    pub(crate) fn barrier(&self) -> CoreResult<()> {
        self.run_sync(|| ())
    }

    fn maybe_spawn_drain(&self, state: &mut QueueState) {
        if !state.draining && state.pending.contains_key(&state.now_serving) {
            state.draining = true;
            let inner = Arc::clone(&self.inner);
            self.inner
                .pool
                .submit(Box::new(move || QueueInner::drain(&inner)));
        }
    }
}

impl QueueInner {
    /// Runs ready pending jobs until the head of the line is a
    /// synchronous waiter or the queue empties.
    fn drain(inner: &Arc<QueueInner>) {
        loop {
            let job = {
                let mut guard = inner.state.lock();
                let state = &mut *guard;
                match state.pending.remove(&state.now_serving) {
                    Some(job) => job,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };

            {
                let _mark = QueueMark::enter(inner.id);
                job();
            }

            let mut state = inner.state.lock();
            state.now_serving += 1;
            inner.turn.notify_all();
        }
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}
