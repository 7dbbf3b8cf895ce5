//! Single-worker background queue for CPU-heavy pipeline work.
//!
//! `push` never blocks: tasks land in a shared pending list drained by one
//! worker thread in FIFO order, and the worker is woken through a one-slot
//! crossbeam channel. Every task carries a [`CancellationToken`] that the
//! queue, the pusher, and the watchdog can flip; the worker skips tasks that
//! were cancelled before they started, and running tasks poll the token at
//! their own checkpoints. Errors and panics inside a task are contained at the
//! worker boundary.
//!
//! The pending list holds the task closures themselves. Cancelled tasks are
//! released on the next push, and pushing past `max_pending` drops the oldest
//! task that has not started yet, so captured buffers never pile up behind a
//! slow task.

use std::{
    collections::VecDeque,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::pipeline::telemetry;

/// Shared cooperative cancellation flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Checkpoint for task bodies: `token.ensure_active()?` bails out early
    /// once the task is stale.
    pub fn ensure_active(&self) -> Result<(), TaskCancelled> {
        if self.is_cancelled() {
            Err(TaskCancelled)
        } else {
            Ok(())
        }
    }
}

/// Returned by a task that observed its cancellation at a checkpoint.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("task cancelled")]
pub struct TaskCancelled;

/// Work item executed on the queue's worker thread.
pub type Task = Box<dyn FnOnce(&CancellationToken) -> anyhow::Result<()> + Send + 'static>;

struct QueuedTask {
    id: u64,
    token: CancellationToken,
    task: Task,
}

/// Snapshot of the task currently executing on the worker.
#[derive(Clone, Debug)]
pub struct InFlightTask {
    pub id: u64,
    pub token: CancellationToken,
    pub elapsed: Duration,
}

struct Running {
    id: u64,
    token: CancellationToken,
    started: Instant,
}

#[derive(Default)]
struct Counters {
    pushed: AtomicU64,
    executed: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    discarded: AtomicU64,
}

/// Lifetime totals for a queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    /// Ran to completion with `Ok`.
    pub executed: u64,
    /// Skipped before starting or returned [`TaskCancelled`].
    pub cancelled: u64,
    pub failed: u64,
    pub panicked: u64,
    /// Dropped by the queue to respect `max_pending`; also counted as cancelled.
    pub discarded: u64,
}

struct Shared {
    name: String,
    pending: Mutex<VecDeque<QueuedTask>>,
    running: Mutex<Option<Running>>,
    counters: Counters,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, VecDeque<QueuedTask>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub struct ThrottledTaskQueue {
    shared: Arc<Shared>,
    wake: Option<Sender<()>>,
    worker: Option<thread::JoinHandle<()>>,
    next_id: AtomicU64,
    max_pending: usize,
}

impl ThrottledTaskQueue {
    /// Start the worker thread. `max_pending` is clamped to at least one.
    pub fn new(name: impl Into<String>, max_pending: usize) -> io::Result<Self> {
        let name = name.into();
        let shared = Arc::new(Shared {
            name: name.clone(),
            pending: Mutex::new(VecDeque::new()),
            running: Mutex::new(None),
            counters: Counters::default(),
        });
        let (wake, woken) = bounded(1);
        let worker_shared = shared.clone();
        let worker = telemetry::spawn_thread(name, move || worker_loop(woken, worker_shared))?;

        Ok(Self {
            shared,
            wake: Some(wake),
            worker: Some(worker),
            next_id: AtomicU64::new(1),
            max_pending: max_pending.max(1),
        })
    }

    /// Enqueue `task` and return its token. Never blocks on the worker.
    pub fn push<F>(&self, task: F) -> CancellationToken
    where
        F: FnOnce(&CancellationToken) -> anyhow::Result<()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.shared.counters.pushed.fetch_add(1, Ordering::Relaxed);

        let depth = {
            let mut pending = self.shared.pending();
            let mut released = 0usize;
            pending.retain(|queued| {
                let stale = queued.token.is_cancelled();
                released += usize::from(stale);
                !stale
            });
            for _ in 0..released {
                Outcome::Cancelled.record(&self.shared.counters);
            }
            while pending.len() >= self.max_pending {
                let Some(stale) = pending.pop_front() else {
                    break;
                };
                stale.token.cancel();
                self.shared.counters.discarded.fetch_add(1, Ordering::Relaxed);
                Outcome::Cancelled.record(&self.shared.counters);
                debug!(queue = %self.shared.name, task = stale.id, "queue full, dropped oldest pending task");
            }
            pending.push_back(QueuedTask {
                id,
                token: token.clone(),
                task: Box::new(task),
            });
            pending.len()
        };
        metrics::gauge!("vision_task_queue_depth").set(depth as f64);

        let delivered = match self.wake.as_ref() {
            Some(wake) => !matches!(wake.try_send(()), Err(TrySendError::Disconnected(()))),
            None => false,
        };
        if !delivered {
            warn!(queue = %self.shared.name, task = id, "worker stopped, dropping task");
            token.cancel();
            let mut pending = self.shared.pending();
            let before = pending.len();
            pending.retain(|queued| queued.id != id);
            if pending.len() < before {
                Outcome::Cancelled.record(&self.shared.counters);
            }
        }
        token
    }

    /// Cancel every queued task and, cooperatively, the one in flight.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = self.shared.pending().drain(..).collect();
        for queued in &drained {
            queued.token.cancel();
            Outcome::Cancelled.record(&self.shared.counters);
        }
        if let Some(running) = self.shared.running().as_ref() {
            running.token.cancel();
        }
        metrics::gauge!("vision_task_queue_depth").set(0.0);
        if !drained.is_empty() {
            debug!(queue = %self.shared.name, cancelled = drained.len(), "cancelled pending tasks");
        }
    }

    /// Task currently executing on the worker, if any.
    pub fn in_flight(&self) -> Option<InFlightTask> {
        self.shared.running().as_ref().map(|running| InFlightTask {
            id: running.id,
            token: running.token.clone(),
            elapsed: running.started.elapsed(),
        })
    }

    /// Number of tasks pushed but not yet picked up by the worker.
    pub fn pending_len(&self) -> usize {
        self.shared.pending().len()
    }

    pub fn stats(&self) -> QueueStats {
        let c = &self.shared.counters;
        QueueStats {
            pushed: c.pushed.load(Ordering::Relaxed),
            executed: c.executed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            panicked: c.panicked.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
        }
    }

    /// Wait until every pushed task has been executed or skipped.
    ///
    /// Returns `false` if `timeout` elapses first.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let stats = self.stats();
            let settled = stats.executed + stats.cancelled + stats.failed + stats.panicked;
            if settled >= stats.pushed && self.in_flight().is_none() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for ThrottledTaskQueue {
    fn drop(&mut self) {
        self.cancel_all();
        self.wake.take();
        if let Some(worker) = self.worker.take() {
            telemetry::join_logged(worker, &self.shared.name);
        }
    }
}

fn worker_loop(woken: Receiver<()>, shared: Arc<Shared>) {
    loop {
        let next = {
            let mut pending = shared.pending();
            let job = pending.pop_front();
            // Mark in flight before releasing the pending lock so observers
            // never see the task in neither place.
            if let Some(job) = job.as_ref() {
                *shared.running() = Some(Running {
                    id: job.id,
                    token: job.token.clone(),
                    started: Instant::now(),
                });
            }
            metrics::gauge!("vision_task_queue_depth").set(pending.len() as f64);
            job
        };
        let Some(job) = next else {
            if woken.recv().is_err() {
                break;
            }
            continue;
        };

        let outcome = if job.token.is_cancelled() {
            trace!(queue = %shared.name, task = job.id, "skipping cancelled task");
            Outcome::Cancelled
        } else {
            run_task(&shared.name, job)
        };
        outcome.record(&shared.counters);
        shared.running().take();
    }
    debug!(queue = %shared.name, "task queue worker exiting");
}

enum Outcome {
    Executed,
    Cancelled,
    Failed,
    Panicked,
}

impl Outcome {
    fn record(self, counters: &Counters) {
        let (counter, label) = match self {
            Outcome::Executed => (&counters.executed, "executed"),
            Outcome::Cancelled => (&counters.cancelled, "cancelled"),
            Outcome::Failed => (&counters.failed, "failed"),
            Outcome::Panicked => (&counters.panicked, "panicked"),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("vision_tasks_total", "outcome" => label).increment(1);
    }
}

fn run_task(queue: &str, job: QueuedTask) -> Outcome {
    let _span = tracing::debug_span!("task_queue.task", queue, task = job.id).entered();
    let started = Instant::now();
    let QueuedTask { id, token, task } = job;

    let result = panic::catch_unwind(AssertUnwindSafe(|| task(&token)));
    metrics::histogram!("vision_stage_latency_seconds", "stage" => "task")
        .record(started.elapsed().as_secs_f64());

    match result {
        Ok(Ok(())) => Outcome::Executed,
        Ok(Err(err)) if err.is::<TaskCancelled>() => {
            trace!(task = id, "task stopped at a cancellation checkpoint");
            Outcome::Cancelled
        }
        Ok(Err(err)) => {
            warn!(task = id, "background task failed: {err:#}");
            Outcome::Failed
        }
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(task = id, "background task panicked: {message}");
            Outcome::Panicked
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
        mpsc,
    };

    use anyhow::bail;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn tasks_run_in_push_order() {
        let queue = ThrottledTaskQueue::new("test-fifo", 64).expect("queue");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let order = order.clone();
            queue.push(move |_| {
                order.lock().expect("order lock").push(i);
                Ok(())
            });
        }
        assert!(queue.wait_idle(WAIT));
        assert_eq!(*order.lock().expect("order lock"), (0..20).collect::<Vec<_>>());
        assert_eq!(queue.stats().executed, 20);
    }

    #[test]
    fn cancelled_task_does_no_work() {
        let queue = ThrottledTaskQueue::new("test-cancel", 8).expect("queue");
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        queue.push(move |_| {
            let _ = gate_rx.recv_timeout(WAIT);
            Ok(())
        });

        let work = Arc::new(AtomicUsize::new(0));
        let counter = work.clone();
        let token = queue.push(move |token| {
            token.ensure_active()?;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        token.cancel();
        gate_tx.send(()).expect("release gate");

        assert!(queue.wait_idle(WAIT));
        assert_eq!(work.load(Ordering::SeqCst), 0);
        let stats = queue.stats();
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.executed, 1);
    }

    #[test]
    fn failures_and_panics_do_not_stop_the_worker() {
        let queue = ThrottledTaskQueue::new("test-faults", 8).expect("queue");
        queue.push(|_| bail!("ocr engine exploded"));
        queue.push(|_| panic!("bad pixel math"));
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        queue.push(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        assert!(queue.wait_idle(WAIT));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        let stats = queue.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.executed, 1);
    }

    #[test]
    fn overflow_cancels_oldest_pending_task() {
        let queue = ThrottledTaskQueue::new("test-overflow", 2).expect("queue");
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        queue.push(move |_| {
            let _ = started_tx.send(());
            let _ = gate_rx.recv_timeout(WAIT);
            Ok(())
        });
        started_rx.recv_timeout(WAIT).expect("blocker started");

        let ran = Arc::new(Mutex::new(Vec::new()));
        let tokens: Vec<_> = (0..3)
            .map(|i| {
                let ran = ran.clone();
                queue.push(move |token| {
                    token.ensure_active()?;
                    ran.lock().expect("ran lock").push(i);
                    Ok(())
                })
            })
            .collect();

        assert!(tokens[0].is_cancelled());
        assert!(!tokens[1].is_cancelled());
        assert_eq!(queue.pending_len(), 2);
        gate_tx.send(()).expect("release gate");

        assert!(queue.wait_idle(WAIT));
        assert_eq!(*ran.lock().expect("ran lock"), vec![1, 2]);
        assert_eq!(queue.stats().discarded, 1);
    }

    struct LiveCount(Arc<AtomicUsize>);

    impl LiveCount {
        fn new(live: &Arc<AtomicUsize>) -> Self {
            live.fetch_add(1, Ordering::SeqCst);
            Self(live.clone())
        }
    }

    impl Drop for LiveCount {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn superseded_tasks_release_their_captures_behind_a_stuck_worker() {
        let queue = ThrottledTaskQueue::new("test-release", 2).expect("queue");
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        queue.push(move |_| {
            let _ = started_tx.send(());
            let _ = gate_rx.recv_timeout(WAIT);
            Ok(())
        });
        started_rx.recv_timeout(WAIT).expect("blocker started");

        let live = Arc::new(AtomicUsize::new(0));
        let mut previous: Option<CancellationToken> = None;
        for _ in 0..500 {
            if let Some(token) = previous.take() {
                token.cancel();
            }
            let capture = LiveCount::new(&live);
            let crop = vec![0u8; 4096];
            previous = Some(queue.push(move |token| {
                token.ensure_active()?;
                let _keep = (&capture, &crop);
                Ok(())
            }));
        }

        assert_eq!(live.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_len(), 1);
        gate_tx.send(()).expect("release gate");

        assert!(queue.wait_idle(WAIT));
        assert_eq!(live.load(Ordering::SeqCst), 0);
        let stats = queue.stats();
        assert_eq!(stats.cancelled, 499);
        assert_eq!(stats.executed, 2);
    }

    #[test]
    fn cancel_all_reaches_the_running_task() {
        let queue = ThrottledTaskQueue::new("test-cancel-all", 8).expect("queue");
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let observed = Arc::new(AtomicBool::new(false));
        let flag = observed.clone();
        queue.push(move |token| {
            let _ = started_tx.send(());
            let deadline = Instant::now() + WAIT;
            while Instant::now() < deadline {
                if token.is_cancelled() {
                    flag.store(true, Ordering::SeqCst);
                    return Err(TaskCancelled.into());
                }
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        });
        let queued = queue.push(|_| Ok(()));

        started_rx.recv_timeout(WAIT).expect("task started");
        assert!(queue.in_flight().is_some());
        queue.cancel_all();

        assert!(queue.wait_idle(WAIT));
        assert!(observed.load(Ordering::SeqCst));
        assert!(queued.is_cancelled());
        assert_eq!(queue.stats().cancelled, 2);
    }

    #[test]
    fn drop_joins_worker_promptly() {
        let queue = ThrottledTaskQueue::new("test-drop", 8).expect("queue");
        for _ in 0..4 {
            queue.push(|token| {
                while !token.is_cancelled() {
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(())
            });
        }
        let started = Instant::now();
        drop(queue);
        assert!(started.elapsed() < WAIT);
    }
}
