//! Worker pool implementation.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::task::{Task, TaskError, TaskId, TaskResult};
use crate::error::{CoreError, Result};

const TASKS_TOTAL: &str = "scheduler_tasks_total";

/// A task accepted into the queue.
struct Job {
    id: TaskId,
    task: Box<dyn Task>,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &std::result::Result<(), TaskError>) {
        let (counter, label) = match outcome {
            Ok(()) => (&self.succeeded, "ok"),
            Err(TaskError::Panicked(_)) => (&self.panicked, "panicked"),
            Err(_) => (&self.failed, "failed"),
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(TASKS_TOTAL, "outcome" => label).increment(1);
    }
}

/// Point-in-time view of a scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStats {
    pub workers: usize,
    pub queue_capacity: usize,
    pub queued: usize,
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub panicked: u64,
    pub stopped: bool,
}

/// Bounded pool of workers executing [`Task`]s.
///
/// The task queue and the result stream are both bounded at twice the
/// worker count. Construct one explicitly and share it by `Arc`; its
/// lifetime should follow application start/stop.
pub struct TaskScheduler {
    workers: usize,
    capacity: usize,
    /// Dropped on stop so workers see the end of the queue once it drains.
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    result_tx: Mutex<Option<mpsc::Sender<TaskResult>>>,
    result_rx: Mutex<Option<mpsc::Receiver<TaskResult>>>,
    /// Cancelled once shutdown begins; pending submissions give up.
    intake_closed: CancellationToken,
    /// Handed to workers and tasks; cancelled on abort or by the parent.
    worker_token: OnceLock<CancellationToken>,
    tracker: TaskTracker,
    stopped: AtomicBool,
    next_id: AtomicU64,
    counters: Arc<Counters>,
}

impl TaskScheduler {
    /// Create a scheduler with `workers` workers. A count of zero is
    /// treated as one.
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let capacity = workers * 2;
        let (sender, receiver) = mpsc::channel(capacity);
        let (result_tx, result_rx) = mpsc::channel(capacity);

        Self {
            workers,
            capacity,
            sender: Mutex::new(Some(sender)),
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            result_tx: Mutex::new(Some(result_tx)),
            result_rx: Mutex::new(Some(result_rx)),
            intake_closed: CancellationToken::new(),
            worker_token: OnceLock::new(),
            tracker: TaskTracker::new(),
            stopped: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Create a scheduler wrapped in an Arc for sharing.
    pub fn new_shared(workers: usize) -> Arc<Self> {
        Arc::new(Self::new(workers))
    }

    /// Spawn the workers.
    ///
    /// Cancelling `parent` stops the workers without draining, like
    /// [`abort`](Self::abort). Calling `start` twice is a no-op.
    pub fn start(&self, parent: &CancellationToken) {
        let token = parent.child_token();
        if self.worker_token.set(token.clone()).is_err() {
            warn!("scheduler already started");
            return;
        }

        // Workers own the only result senders, so the stream ends when the
        // last worker exits. Without a listener, results are discarded.
        let listening = self.result_rx.lock().is_none();
        let results = self.result_tx.lock().take().filter(|_| listening);
        drop(self.result_rx.lock().take());

        for index in 0..self.workers {
            let receiver = Arc::clone(&self.receiver);
            let results = results.clone();
            let counters = Arc::clone(&self.counters);
            let token = token.clone();
            self.tracker.spawn(async move {
                run_worker(index, receiver, results, counters, token).await
            });
        }

        info!(
            workers = self.workers,
            queue_capacity = self.capacity,
            "Task scheduler started"
        );
    }

    /// Enqueue a task, waiting while the queue is full.
    ///
    /// Returns `None` without running the task if shutdown has begun, either
    /// before the call or while it waited for queue space.
    pub async fn submit<T: Task>(&self, task: T) -> Option<TaskId> {
        self.submit_boxed(Box::new(task)).await
    }

    /// Boxed variant of [`submit`](Self::submit).
    pub async fn submit_boxed(&self, task: Box<dyn Task>) -> Option<TaskId> {
        let Some(sender) = self.sender.lock().clone() else {
            debug!(task = task.name(), "submission after shutdown ignored");
            return None;
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tokio::select! {
            biased;
            _ = self.intake_closed.cancelled() => {
                debug!(task_id = id, "submission after shutdown ignored");
                None
            }
            sent = sender.send(Job { id, task }) => match sent {
                Ok(()) => {
                    self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                    Some(id)
                }
                Err(_) => None,
            },
        }
    }

    /// Enqueue a task without waiting.
    ///
    /// Fails with [`CoreError::CapacityExceeded`] when the queue is full and
    /// [`CoreError::SchedulerStopped`] once shutdown has begun.
    pub fn try_submit<T: Task>(&self, task: T) -> Result<TaskId> {
        if self.intake_closed.is_cancelled() {
            return Err(CoreError::SchedulerStopped);
        }
        let guard = self.sender.lock();
        let sender = guard.as_ref().ok_or(CoreError::SchedulerStopped)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        match sender.try_send(Job {
            id,
            task: Box::new(task),
        }) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(id)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(CoreError::capacity_exceeded("task queue", self.capacity))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CoreError::SchedulerStopped),
        }
    }

    /// Take the result stream. Only the first call before
    /// [`start`](Self::start) gets it; a scheduler started without a taker
    /// discards results.
    ///
    /// Whoever holds the stream must keep draining it: workers wait for room
    /// in the bounded stream before picking up their next task. Dropping the
    /// receiver is fine.
    pub fn take_results(&self) -> Option<mpsc::Receiver<TaskResult>> {
        self.result_rx.lock().take()
    }

    /// Stop accepting submissions, let the workers drain the queue, and
    /// wait for them to exit. The result stream closes afterwards.
    ///
    /// Idempotent. Tasks queued on a scheduler that was never started are
    /// dropped.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            self.tracker.wait().await;
            return;
        }

        self.intake_closed.cancel();
        drop(self.sender.lock().take());
        drop(self.result_tx.lock().take());

        self.tracker.close();
        self.tracker.wait().await;

        let stats = self.stats();
        info!(
            submitted = stats.submitted,
            succeeded = stats.succeeded,
            failed = stats.failed,
            panicked = stats.panicked,
            "Task scheduler stopped"
        );
    }

    /// Cancel the workers immediately. Queued tasks are never run and
    /// running tasks see their token cancelled. Follow with
    /// [`stop`](Self::stop) to wait for the workers to exit.
    pub fn abort(&self) {
        self.intake_closed.cancel();
        if let Some(token) = self.worker_token.get() {
            token.cancel();
        }
        warn!("Task scheduler aborted");
    }

    /// Whether shutdown has begun.
    pub fn is_stopped(&self) -> bool {
        self.intake_closed.is_cancelled()
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    pub fn stats(&self) -> SchedulerStats {
        let queued = self
            .sender
            .lock()
            .as_ref()
            .map(|s| s.max_capacity() - s.capacity())
            .unwrap_or(0);

        SchedulerStats {
            workers: self.workers,
            queue_capacity: self.capacity,
            queued,
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
            stopped: self.is_stopped(),
        }
    }
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("workers", &self.workers)
            .field("capacity", &self.capacity)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

async fn run_worker(
    index: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    results: Option<mpsc::Sender<TaskResult>>,
    counters: Arc<Counters>,
    token: CancellationToken,
) {
    debug!(worker = index, "worker started");

    loop {
        let job = {
            let mut rx = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                guard = receiver.lock() => guard,
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                job = rx.recv() => job,
            }
        };

        // Queue closed and drained.
        let Some(Job { id, task }) = job else { break };

        let name = task.name().to_owned();
        let outcome = match AssertUnwindSafe(task.execute(token.clone()))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(worker = index, task_id = id, task = %name, panic = %message, "Task panicked");
                Err(TaskError::Panicked(message))
            }
        };

        if let Err(e) = &outcome {
            debug!(worker = index, task_id = id, task = %name, error = %e, "task finished with error");
        }

        counters.record(&outcome);

        if let Some(results) = &results {
            let result = TaskResult { id, name, outcome };
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                // A dropped receiver just means nobody is listening.
                _ = results.send(result) => {}
            }
        }
    }

    debug!(worker = index, "worker exited");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}
