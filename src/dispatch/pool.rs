//! Elastic worker pool running tile load jobs on OS threads.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;

use super::worker::WorkerContext;

/// Default number of workers kept alive while idle.
pub const DEFAULT_CORE_WORKERS: usize = 2;

/// Default upper bound on workers.
pub const DEFAULT_MAX_WORKERS: usize = 16;

/// Default time an extra idle worker waits before retiring.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

// =============================================================================
// Job Trait
// =============================================================================

/// A unit of work executed on a pool worker.
pub trait Job: Send + 'static {
    /// Run to completion. `ctx` reports interrupts requested by the pool.
    fn run(self: Box<Self>, ctx: &WorkerContext);
}

impl<F> Job for F
where
    F: FnOnce(&WorkerContext) + Send + 'static,
{
    fn run(self: Box<Self>, ctx: &WorkerContext) {
        (*self)(ctx)
    }
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Workers that never retire for idleness.
    pub core_workers: usize,
    /// Upper bound on live workers.
    pub max_workers: usize,
    /// Idle time after which a worker above the core size exits.
    pub keep_alive: Duration,
    /// Thread name prefix; workers are named `{prefix}-{n}`.
    pub thread_name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            core_workers: DEFAULT_CORE_WORKERS,
            max_workers: DEFAULT_MAX_WORKERS,
            keep_alive: DEFAULT_KEEP_ALIVE,
            thread_name: "tile-worker".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn new(core_workers: usize, max_workers: usize) -> Self {
        Self {
            core_workers,
            max_workers: max_workers.max(core_workers).max(1),
            ..Self::default()
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

struct PoolState {
    queue: VecDeque<Box<dyn Job>>,
    workers: usize,
    idle: usize,
    next_id: usize,
    shutdown: bool,
    contexts: HashMap<usize, WorkerContext>,
    handles: Vec<JoinHandle<()>>,
}

struct Shared {
    config: DispatcherConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Managed pool of worker threads with an unbounded FIFO queue.
///
/// - Up to `core_workers` threads are started on demand and kept while idle
/// - When every live worker is busy the pool grows up to `max_workers`
/// - Workers above the core size retire after `keep_alive` without work
/// - Each worker owns a [`WorkerContext`] whose interrupts are deferred while
///   the job is inside a critical section
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use atlas_tiles::dispatch::{DispatcherConfig, JobDispatcher, WorkerContext};
///
/// let pool = JobDispatcher::new(DispatcherConfig::new(1, 2));
/// let done = Arc::new(AtomicUsize::new(0));
/// let counter = done.clone();
/// pool.submit(move |_ctx: &WorkerContext| {
///     counter.fetch_add(1, Ordering::SeqCst);
/// })
/// .unwrap();
/// pool.shutdown_and_wait();
/// assert!(done.load(Ordering::SeqCst) <= 1);
/// ```
pub struct JobDispatcher {
    shared: Arc<Shared>,
}

impl JobDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        info!(
            core = config.core_workers,
            max = config.max_workers,
            keep_alive_secs = config.keep_alive.as_secs(),
            "Starting job dispatcher"
        );
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    workers: 0,
                    idle: 0,
                    next_id: 0,
                    shutdown: false,
                    contexts: HashMap::new(),
                    handles: Vec::new(),
                }),
                available: Condvar::new(),
            }),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    /// Queue a job. Fails once the dispatcher has been shut down.
    pub fn submit(&self, job: impl Job) -> Result<(), DispatchError> {
        self.submit_boxed(Box::new(job))
    }

    pub fn submit_boxed(&self, job: Box<dyn Job>) -> Result<(), DispatchError> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(DispatchError::ShutDown);
        }
        state.queue.push_back(job);

        let config = &self.shared.config;
        let below_core = state.workers < config.core_workers;
        let starved = state.queue.len() > state.idle && state.workers < config.max_workers;
        if below_core || starved {
            spawn_worker(&self.shared, &mut state);
        }
        drop(state);

        self.shared.available.notify_one();
        Ok(())
    }

    /// Drop every job that has not started yet. Running jobs complete.
    pub fn cancel_outstanding_jobs(&self) -> usize {
        let dropped = {
            let mut state = self.shared.state.lock();
            let dropped = state.queue.len();
            state.queue.clear();
            dropped
        };
        if dropped > 0 {
            debug!(dropped, "Cancelled outstanding jobs");
        }
        dropped
    }

    /// Interrupt every running job. Jobs inside a critical section see the
    /// interrupt when the section ends.
    pub fn interrupt_running(&self) {
        let state = self.shared.state.lock();
        for ctx in state.contexts.values() {
            ctx.interrupt();
        }
    }

    /// Stop accepting jobs, drop queued ones and interrupt running ones.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        let dropped = state.queue.len();
        state.queue.clear();
        for ctx in state.contexts.values() {
            ctx.interrupt();
        }
        drop(state);

        self.shared.available.notify_all();
        info!(dropped, "Job dispatcher shutting down");
    }

    /// [`shutdown`](Self::shutdown), then join every worker thread.
    pub fn shutdown_and_wait(&self) {
        self.shutdown();
        let handles = std::mem::take(&mut self.shared.state.lock().handles);
        for handle in handles {
            if handle.join().is_err() {
                warn!("Worker thread terminated abnormally");
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Live worker threads.
    pub fn worker_count(&self) -> usize {
        self.shared.state.lock().workers
    }

    pub fn idle_count(&self) -> usize {
        self.shared.state.lock().idle
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }
}

impl Drop for JobDispatcher {
    fn drop(&mut self) {
        self.shutdown_and_wait();
    }
}

fn spawn_worker(shared: &Arc<Shared>, state: &mut PoolState) {
    let id = state.next_id;
    let ctx = WorkerContext::default();
    let name = format!("{}-{}", shared.config.thread_name, id);
    let worker_shared = shared.clone();
    let worker_ctx = ctx.clone();

    match thread::Builder::new()
        .name(name.clone())
        .spawn(move || worker_loop(worker_shared, id, worker_ctx))
    {
        Ok(handle) => {
            state.next_id += 1;
            state.workers += 1;
            state.contexts.insert(id, ctx);
            state.handles.retain(|h| !h.is_finished());
            state.handles.push(handle);
            debug!(worker = %name, workers = state.workers, "Spawned worker");
        }
        Err(e) => {
            error!(worker = %name, error = %e, "Failed to spawn worker thread");
        }
    }
}

fn worker_loop(shared: Arc<Shared>, id: usize, ctx: WorkerContext) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    break job;
                }
                if state.shutdown {
                    retire(&mut state, id);
                    return;
                }

                state.idle += 1;
                let timed_out = shared
                    .available
                    .wait_for(&mut state, shared.config.keep_alive)
                    .timed_out();
                state.idle -= 1;

                if timed_out && state.queue.is_empty() && state.workers > shared.config.core_workers {
                    retire(&mut state, id);
                    debug!(worker = id, "Retired idle worker");
                    return;
                }
            }
        };

        ctx.clear();
        if panic::catch_unwind(AssertUnwindSafe(|| job.run(&ctx))).is_err() {
            error!(worker = id, "Job panicked");
        }
    }
}

fn retire(state: &mut PoolState, id: usize) {
    state.workers -= 1;
    state.contexts.remove(&id);
}
