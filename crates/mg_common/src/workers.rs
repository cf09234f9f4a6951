//! The worker pool running chunk synthesis off the dispatching thread.

use std::time::{Duration, Instant};

use tokio::runtime::{Handle, Runtime};

use crate::prelude::*;

/// Decrements the in-flight counter even if the job panics.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, AtomicOrdering::AcqRel);
    }
}

/// A dedicated multi-threaded tokio runtime; jobs may block on terrain I/O, so they run on its blocking threads.
pub struct WorkerPool {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    in_flight: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Starts the runtime threads.
    pub fn new(worker_threads: usize, max_blocking_threads: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(worker_threads.max(1))
            .max_blocking_threads(max_blocking_threads.max(1))
            .thread_name("Mirage Chunk Worker")
            .build()
            .context("Could not initialize the tokio runtime for the chunk workers")?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            in_flight: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
        })
    }

    /// Handle of the runtime, for spawning timers.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Queues a job. Returns `false` once the pool is shut down.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) -> bool {
        if self.closed.load(AtomicOrdering::Acquire) {
            return false;
        }
        self.in_flight.fetch_add(1, AtomicOrdering::AcqRel);
        let guard = InFlightGuard(Arc::clone(&self.in_flight));
        drop(self.handle.spawn_blocking(move || {
            let _guard = guard;
            job();
        }));
        true
    }

    /// Jobs queued or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(AtomicOrdering::Acquire)
    }

    /// Checks if [`Self::shutdown`] was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::Acquire)
    }

    /// Blocks until no job is queued or running, or the timeout passes. Returns `true` if the pool went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Stops accepting jobs, waits up to `timeout` for the queued ones, then terminates the runtime.
    /// Returns `true` if every job completed. Must not be called from within an async context.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.closed.store(true, AtomicOrdering::Release);
        let start = Instant::now();
        let drained = self.wait_idle(timeout);
        if !drained {
            warn!(abandoned = self.in_flight(), "Chunk workers did not drain before the shutdown timeout");
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_timeout(timeout.saturating_sub(start.elapsed()));
        }
        drained
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}
