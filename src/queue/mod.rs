//! Bounded work queue.
//!
//! A fixed pool of OS threads pulls boxed tasks from one shared channel.
//! [`WorkQueue::parallel_map`] submits one task per item and blocks the caller
//! until every result is in, returning them in input order.
//!
//! # Helper-drain
//!
//! Tasks may call `parallel_map` themselves (extracting an archive spawns work
//! for the archives inside it). A pool of N workers where all N are blocked on
//! their own sub-tasks would deadlock, so a caller never waits idly.
//!
//! Each call keeps its tasks in a private batch and puts one pull token per
//! task on the shared channel. A worker receiving a token runs the next task
//! of that batch, if any is left. The caller runs its own batch in place
//! until it is empty, then blocks on its results: every task it still waits
//! for is already running somewhere. A caller never runs another call's
//! tasks, so stack depth is bounded by nesting depth, not by queue length.
//!
//! ```text
//! caller ──tokens──▶ [ shared task channel ] ◀──recv── worker 1..N
//!    │                                                   │
//!    └──── runs from ──▶ [ own batch ] ◀── pops from ────┘
//! ```

mod resource;

pub use resource::{Resource, Ticket};

use crate::error::{Error, Result};
use crate::progress::{percent, ProgressSink};

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, trace};

/// Cooperative cancellation flag, checked between units of work.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Error::Cancelled)` once cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Observable state of one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkSlot {
    pub id: usize,
    pub message: String,
    pub percent: f32,
    pub is_working: bool,
}

impl WorkSlot {
    fn idle(id: usize) -> Self {
        Self {
            id,
            message: "Waiting".to_string(),
            percent: 0.0,
            is_working: false,
        }
    }
}

struct Slots {
    slots: Vec<Mutex<WorkSlot>>,
    sink: Option<Arc<dyn ProgressSink>>,
}

/// Where a task is running: a pool worker (with a status slot) or a helping caller.
struct Runner<'a> {
    slot: Option<(&'a Slots, usize)>,
}

impl Runner<'_> {
    const HELPER: Runner<'static> = Runner { slot: None };

    fn report(&self, message: String, pct: f32, is_working: bool) {
        let Some((slots, id)) = self.slot else {
            return;
        };
        if let Some(sink) = &slots.sink {
            sink.report(&message, pct);
        }
        if let Some(slot) = slots.slots.get(id) {
            let mut slot = slot.lock().unwrap_or_else(|p| p.into_inner());
            slot.message = message;
            slot.percent = pct;
            slot.is_working = is_working;
        }
    }
}

type Task = Box<dyn FnOnce(&Runner<'_>) + Send + 'static>;

/// Tasks of one `parallel_map` call not yet picked up.
type Batch = Arc<Mutex<VecDeque<Task>>>;

fn pop_task(batch: &Batch) -> Option<Task> {
    batch.lock().unwrap_or_else(|p| p.into_inner()).pop_front()
}

struct Shared {
    tx: Option<Sender<Task>>,
    rx: Receiver<Task>,
    slots: Arc<Slots>,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Closing the channel lets idle workers fall out of recv()
        self.tx.take();
        let me = thread::current().id();
        for handle in self.workers.drain(..) {
            // The last handle can be released by a task running on a worker
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                error!("Work queue thread panicked during shutdown");
            }
        }
    }
}

/// Handle to a worker pool. Cheap to clone; the pool shuts down when the last
/// handle is dropped.
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl WorkQueue {
    /// Start a pool with `workers` threads (at least one).
    pub fn new(workers: usize) -> Self {
        Self::build(workers, None, CancellationToken::new())
    }

    /// Start a pool that mirrors every worker status change into `sink`.
    pub fn with_sink(workers: usize, sink: Arc<dyn ProgressSink>) -> Self {
        Self::build(workers, Some(sink), CancellationToken::new())
    }

    /// Start a pool sharing an existing cancellation token.
    pub fn with_cancellation(workers: usize, cancel: CancellationToken) -> Self {
        Self::build(workers, None, cancel)
    }

    fn build(workers: usize, sink: Option<Arc<dyn ProgressSink>>, cancel: CancellationToken) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = unbounded::<Task>();
        let slots = Arc::new(Slots {
            slots: (0..workers).map(|id| Mutex::new(WorkSlot::idle(id))).collect(),
            sink,
        });

        let handles = (0..workers)
            .filter_map(|id| {
                let rx = rx.clone();
                let slots = Arc::clone(&slots);
                thread::Builder::new()
                    .name(format!("clf3-vfs-worker-{}", id))
                    .spawn(move || worker_loop(id, rx, slots))
                    .map_err(|e| error!("Failed to spawn worker {}: {}", id, e))
                    .ok()
            })
            .collect::<Vec<_>>();

        debug!("Started work queue with {} workers", handles.len());

        Self {
            shared: Arc::new(Shared {
                tx: Some(tx),
                rx,
                slots,
                cancel,
                workers: handles,
            }),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.shared.slots.slots.len()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Snapshot of every worker's status slot.
    pub fn status(&self) -> Vec<WorkSlot> {
        self.shared
            .slots
            .slots
            .iter()
            .map(|s| s.lock().unwrap_or_else(|p| p.into_inner()).clone())
            .collect()
    }

    /// Pull tokens submitted but not yet picked up by a worker.
    pub fn pending(&self) -> usize {
        self.shared.rx.len()
    }

    /// Queue a pull token for `batch`.
    fn submit(&self, batch: &Batch) {
        let batch = Arc::clone(batch);
        let task: Task = Box::new(move |runner: &Runner<'_>| {
            // Empty when the waiting caller already ran it
            if let Some(task) = pop_task(&batch) {
                task(runner);
            }
        });
        match &self.shared.tx {
            Some(tx) => {
                if let Err(e) = tx.send(task) {
                    // Only possible during shutdown: run it here rather than lose it
                    (e.into_inner())(&Runner::HELPER);
                }
            }
            None => task(&Runner::HELPER),
        }
    }

    /// Map `f` over `items` on the pool; see [`parallel_map_labeled`](Self::parallel_map_labeled).
    pub fn parallel_map<T, R, F>(&self, items: Vec<T>, f: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Result<R> + Send + Sync + 'static,
    {
        self.parallel_map_labeled("Working", items, f)
    }

    /// Map `f` over `items` on the pool, blocking until all tasks are done.
    ///
    /// Results keep the order of `items`. When a task fails, tasks of this call
    /// that have not started yet are skipped, started ones finish, and the first
    /// error is returned. A panicking task becomes [`Error::TaskFault`].
    pub fn parallel_map_labeled<T, R, F>(&self, label: &str, items: Vec<T>, f: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Result<R> + Send + Sync + 'static,
    {
        let total = items.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let f = Arc::new(f);
        let failed = Arc::new(AtomicBool::new(false));
        let completed = Arc::new(AtomicUsize::new(0));
        let label: Arc<str> = Arc::from(label);
        let (done_tx, done_rx) = unbounded::<(usize, Result<R>)>();
        let batch: Batch = Arc::new(Mutex::new(VecDeque::with_capacity(total)));

        for (idx, item) in items.into_iter().enumerate() {
            let f = Arc::clone(&f);
            let failed = Arc::clone(&failed);
            let completed = Arc::clone(&completed);
            let label = Arc::clone(&label);
            let cancel = self.shared.cancel.clone();
            let done_tx = done_tx.clone();

            let task: Task = Box::new(move |runner: &Runner<'_>| {
                let result = if failed.load(Ordering::SeqCst) || cancel.is_cancelled() {
                    Err(Error::Cancelled)
                } else {
                    runner.report(
                        format!("{} ({}/{})", label, idx + 1, total),
                        percent(completed.load(Ordering::Relaxed), total),
                        true,
                    );
                    match catch_unwind(AssertUnwindSafe(|| f(item))) {
                        Ok(result) => result,
                        Err(payload) => Err(Error::TaskFault(panic_message(payload.as_ref()))),
                    }
                };
                if result.is_err() {
                    failed.store(true, Ordering::SeqCst);
                }
                completed.fetch_add(1, Ordering::Relaxed);
                runner.report("Waiting".to_string(), 0.0, false);
                // The caller may have gone away only if it panicked itself
                let _ = done_tx.send((idx, result));
            });
            batch.lock().unwrap_or_else(|p| p.into_inner()).push_back(task);
        }
        drop(done_tx);

        for _ in 0..total {
            self.submit(&batch);
        }

        self.wait_for(total, &batch, done_rx)
    }

    /// Run `f` for every item, discarding results.
    pub fn parallel_for_each<T, F>(&self, items: Vec<T>, f: F) -> Result<()>
    where
        T: Send + 'static,
        F: Fn(T) -> Result<()> + Send + Sync + 'static,
    {
        self.parallel_map(items, f).map(|_| ())
    }

    /// Run what is left of `batch` in place, then collect `total` results.
    fn wait_for<R>(&self, total: usize, batch: &Batch, done_rx: Receiver<(usize, Result<R>)>) -> Result<Vec<R>> {
        let mut helped = 0usize;
        while let Some(task) = pop_task(batch) {
            task(&Runner::HELPER);
            helped += 1;
        }
        if helped > 0 {
            trace!("Caller ran {} of its {} tasks while waiting", helped, total);
        }

        let mut results: Vec<Option<R>> = (0..total).map(|_| None).collect();
        let mut first_error: Option<Error> = None;

        for _ in 0..total {
            let Ok((idx, result)) = done_rx.recv() else {
                return Err(Error::TaskFault("result channel closed before all tasks reported".into()));
            };
            match result {
                Ok(value) => results[idx] = Some(value),
                // Skipped siblings report Cancelled; keep the error that caused it
                Err(e) => {
                    let replace = match &first_error {
                        None => true,
                        Some(Error::Cancelled) => !matches!(e, Error::Cancelled),
                        Some(_) => false,
                    };
                    if replace {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        results
            .into_iter()
            .collect::<Option<Vec<R>>>()
            .ok_or_else(|| Error::TaskFault("task finished without a result".into()))
    }
}

fn worker_loop(id: usize, rx: Receiver<Task>, slots: Arc<Slots>) {
    let runner = Runner {
        slot: Some((slots.as_ref(), id)),
    };
    while let Ok(task) = rx.recv() {
        task(&runner);
    }
    trace!("Worker {} exiting", id);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}
