//! Bounded CPU worker pool for image transformations.
//!
//! The pool is the concurrency gate for the codec pipeline: CPU-bound work
//! runs on dedicated OS threads, never on the async runtime. Tasks queue
//! FIFO; any idle worker may pull.
//!
//! # Elasticity
//!
//! The pool keeps `min_threads` workers alive and grows on demand up to
//! `max_threads`. A worker idle past `idle_timeout` exits if the pool is
//! above its minimum.
//!
//! # Failure model
//!
//! A failing task produces an outcome with `success = false` and an empty
//! buffer. The pool only errors at submission time (shutdown or a full
//! queue). A task is never cancelled once it begins; queued tasks are
//! cancelled only by shutdown.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::error::PoolError;
use crate::transform::{EncodedFormat, ImageOptimizer, OptimizeOptions};

/// Default maximum number of worker threads.
pub const DEFAULT_MAX_THREADS: usize = 4;

/// Default minimum number of worker threads kept alive.
pub const DEFAULT_MIN_THREADS: usize = 1;

/// Default idle timeout before a surplus worker exits.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 5000;

/// Default ceiling on the waiting queue.
pub const DEFAULT_QUEUE_CEILING: usize = 10_000;

// =============================================================================
// Configuration
// =============================================================================

/// Worker pool sizing.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Workers kept alive even when idle
    pub min_threads: usize,

    /// Upper bound on concurrent workers
    pub max_threads: usize,

    /// How long a surplus worker may idle before exiting
    pub idle_timeout: Duration,

    /// Maximum number of queued (not yet started) tasks
    pub queue_ceiling: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_threads: DEFAULT_MIN_THREADS,
            max_threads: DEFAULT_MAX_THREADS,
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            queue_ceiling: DEFAULT_QUEUE_CEILING,
        }
    }
}

// =============================================================================
// Tasks and Outcomes
// =============================================================================

/// One unit of optimization work.
#[derive(Debug)]
pub struct OptimizeTask {
    /// Source image bytes
    pub bytes: Bytes,

    /// Accepted optimization options
    pub options: OptimizeOptions,

    /// Original filename, carried through to the outcome
    pub original_name: String,
}

/// The result of one task, successful or not.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    /// Optimized bytes; empty when the task failed
    pub bytes: Bytes,

    /// Size of the source in bytes
    pub original_size: u64,

    /// Size of the optimized output in bytes (0 on failure)
    pub optimized_size: u64,

    /// Original filename from the task
    pub original_name: String,

    /// The encoding actually produced (relevant for `auto`)
    pub format: Option<EncodedFormat>,

    /// Whether the transformation succeeded
    pub success: bool,

    /// Failure message when `success` is false
    pub error: Option<String>,
}

impl TaskOutcome {
    fn failed(original_name: String, original_size: u64, message: String) -> Self {
        Self {
            bytes: Bytes::new(),
            original_size,
            optimized_size: 0,
            original_name,
            format: None,
            success: false,
            error: Some(message),
        }
    }
}

/// Pool gauges, surfaced by the stats endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Tasks waiting in the queue
    pub queued: usize,

    /// Workers currently executing a task
    pub active: usize,

    /// Total live workers
    pub workers: usize,

    pub min_threads: usize,
    pub max_threads: usize,
}

// =============================================================================
// Internals
// =============================================================================

struct Job {
    task: OptimizeTask,
    reply: oneshot::Sender<TaskOutcome>,
}

struct PoolState {
    jobs: VecDeque<Job>,
    workers: usize,
    idle: usize,
    shutdown: bool,
    next_worker_id: usize,
}

struct Shared {
    state: Mutex<PoolState>,
    available: Condvar,
    config: PoolConfig,
    optimizer: ImageOptimizer,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        // A panicking task poisons the lock; the queue itself is still
        // consistent, so recover the guard.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// =============================================================================
// Worker Pool
// =============================================================================

/// Elastic pool of CPU workers executing [`OptimizeTask`]s.
///
/// # Example
///
/// ```ignore
/// use imgopt::pool::{OptimizeTask, PoolConfig, WorkerPool};
///
/// let pool = WorkerPool::new(PoolConfig::default());
/// let outcome = pool.submit(task).await?;
/// println!("optimized {} -> {} bytes", outcome.original_size, outcome.optimized_size);
/// ```
pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Create a pool and pre-spawn its minimum worker set.
    pub fn new(config: PoolConfig) -> Self {
        let max_threads = config.max_threads.max(1);
        let min_threads = config.min_threads.min(max_threads);
        let config = PoolConfig {
            min_threads,
            max_threads,
            ..config
        };

        let pool = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    jobs: VecDeque::new(),
                    workers: 0,
                    idle: 0,
                    shutdown: false,
                    next_worker_id: 0,
                }),
                available: Condvar::new(),
                config,
                optimizer: ImageOptimizer::new(),
            }),
        };

        let mut state = pool.shared.lock_state();
        for _ in 0..min_threads {
            pool.spawn_worker(&mut state);
        }
        drop(state);

        pool
    }

    /// Submit one task and await its outcome.
    ///
    /// Errors only when the submission is rejected; a failing task resolves
    /// to an outcome with `success = false`.
    pub async fn submit(&self, task: OptimizeTask) -> Result<TaskOutcome, PoolError> {
        let name = task.original_name.clone();
        let size = task.bytes.len() as u64;
        let rx = self.enqueue_batch(vec![task])?.pop().ok_or(PoolError::WorkerLost)?;

        Ok(await_outcome(rx, name, size).await)
    }

    /// Submit a batch and await all outcomes, positionally.
    ///
    /// Admission is all-or-nothing: either every task fits in the queue or
    /// the whole submission is rejected.
    pub async fn submit_many(
        &self,
        tasks: Vec<OptimizeTask>,
    ) -> Result<Vec<TaskOutcome>, PoolError> {
        let meta: Vec<(String, u64)> = tasks
            .iter()
            .map(|t| (t.original_name.clone(), t.bytes.len() as u64))
            .collect();
        let receivers = self.enqueue_batch(tasks)?;

        let mut outcomes = Vec::with_capacity(receivers.len());
        for (rx, (name, size)) in receivers.into_iter().zip(meta) {
            outcomes.push(await_outcome(rx, name, size).await);
        }
        Ok(outcomes)
    }

    /// Check whether `pending` more tasks would currently be admitted.
    pub fn check_capacity(&self, pending: usize) -> Result<(), PoolError> {
        let state = self.shared.lock_state();
        if state.shutdown {
            return Err(PoolError::ShuttingDown);
        }
        if state.jobs.len() + pending > self.shared.config.queue_ceiling {
            return Err(PoolError::QueueFull {
                depth: state.jobs.len(),
                ceiling: self.shared.config.queue_ceiling,
            });
        }
        Ok(())
    }

    /// Current pool gauges.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock_state();
        PoolStats {
            queued: state.jobs.len(),
            active: state.workers - state.idle,
            workers: state.workers,
            min_threads: self.shared.config.min_threads,
            max_threads: self.shared.config.max_threads,
        }
    }

    /// Reject new submissions, cancel queued tasks and let in-flight tasks
    /// drain.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock_state();
        state.shutdown = true;
        let cancelled = state.jobs.len();
        state.jobs.clear();
        drop(state);
        self.shared.available.notify_all();

        if cancelled > 0 {
            debug!(cancelled, "cancelled queued tasks at shutdown");
        }
    }

    /// Wait for every worker to exit after [`WorkerPool::shutdown`].
    pub async fn drained(&self) {
        loop {
            if self.shared.lock_state().workers == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn enqueue_batch(
        &self,
        tasks: Vec<OptimizeTask>,
    ) -> Result<Vec<oneshot::Receiver<TaskOutcome>>, PoolError> {
        let mut state = self.shared.lock_state();
        if state.shutdown {
            return Err(PoolError::ShuttingDown);
        }
        if state.jobs.len() + tasks.len() > self.shared.config.queue_ceiling {
            return Err(PoolError::QueueFull {
                depth: state.jobs.len(),
                ceiling: self.shared.config.queue_ceiling,
            });
        }

        let mut receivers = Vec::with_capacity(tasks.len());
        for task in tasks {
            let (tx, rx) = oneshot::channel();
            state.jobs.push_back(Job { task, reply: tx });
            receivers.push(rx);
            self.maybe_spawn(&mut state);
        }
        drop(state);
        self.shared.available.notify_all();
        Ok(receivers)
    }

    /// Grow the pool when queued work outnumbers idle workers.
    fn maybe_spawn(&self, state: &mut PoolState) {
        if state.jobs.len() > state.idle && state.workers < self.shared.config.max_threads {
            self.spawn_worker(state);
        }
    }

    fn spawn_worker(&self, state: &mut PoolState) {
        let id = state.next_worker_id;
        state.next_worker_id += 1;

        let shared = Arc::clone(&self.shared);
        let result = std::thread::Builder::new()
            .name(format!("imgopt-worker-{}", id))
            .spawn(move || worker_loop(shared));

        match result {
            Ok(_) => state.workers += 1,
            Err(e) => error!(worker_id = id, error = %e, "failed to spawn worker thread"),
        }
    }
}

async fn await_outcome(
    rx: oneshot::Receiver<TaskOutcome>,
    original_name: String,
    original_size: u64,
) -> TaskOutcome {
    match rx.await {
        Ok(outcome) => outcome,
        // The job was dropped without running (pool shutdown).
        Err(_) => TaskOutcome::failed(
            original_name,
            original_size,
            "task cancelled by pool shutdown".to_string(),
        ),
    }
}

// =============================================================================
// Worker Loop
// =============================================================================

fn worker_loop(shared: Arc<Shared>) {
    let mut state = shared.lock_state();
    loop {
        if let Some(job) = state.jobs.pop_front() {
            drop(state);
            process(&shared, job);
            state = shared.lock_state();
            continue;
        }

        if state.shutdown {
            state.workers -= 1;
            return;
        }

        state.idle += 1;
        let (guard, timeout) = shared
            .available
            .wait_timeout(state, shared.config.idle_timeout)
            .unwrap_or_else(|e| e.into_inner());
        state = guard;
        state.idle -= 1;

        let surplus = state.workers > shared.config.min_threads;
        if timeout.timed_out() && state.jobs.is_empty() && !state.shutdown && surplus {
            state.workers -= 1;
            return;
        }
    }
}

fn process(shared: &Shared, job: Job) {
    let original_size = job.task.bytes.len() as u64;
    let original_name = job.task.original_name.clone();

    let outcome = match shared
        .optimizer
        .optimize(&job.task.bytes, &job.task.options)
    {
        Ok(result) => TaskOutcome {
            optimized_size: result.bytes.len() as u64,
            bytes: result.bytes,
            original_size,
            original_name,
            format: Some(result.format),
            success: true,
            error: None,
        },
        Err(e) => {
            warn!(file = %original_name, error = %e, "optimization task failed");
            TaskOutcome::failed(original_name, original_size, e.to_string())
        }
    };

    if job.reply.send(outcome).is_err() {
        debug!("task result receiver dropped");
    }
}

// =============================================================================
// Tests
// =============================================================================
