//! Background task execution.
//!
//! The renderer hands slow, non-interactive work (PNG encoding, file writes) to a
//! [`TaskPool`] so the render thread never waits on it. Tasks are ordinary futures
//! driven by an `async-executor` on a fixed set of named threads.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use async_executor::Executor;

pub use async_executor::Task;

/// How long an idle worker sleeps before polling the executor again.
const IDLE_BACKOFF: Duration = Duration::from_millis(1);

/// A fixed-size pool of threads driving a shared async executor.
///
/// ```
/// use lumen_core::TaskPool;
///
/// let pool = TaskPool::new(2);
/// let task = pool.spawn(async { 6 * 7 });
/// assert_eq!(pool.block_on(task), 42);
/// ```
pub struct TaskPool {
    executor: Arc<Executor<'static>>,
    threads: Vec<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl TaskPool {
    /// Create a pool with `num_threads` workers (at least one is requested).
    ///
    /// A worker that the OS refuses to start is logged and skipped. Even with no
    /// workers, [`TaskPool::block_on`] still makes progress by driving the executor
    /// on the calling thread.
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let executor = Arc::new(Executor::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::with_capacity(num_threads);

        for i in 0..num_threads {
            let exec = executor.clone();
            let stop = shutdown.clone();

            let spawned = thread::Builder::new()
                .name(format!("lumen-task-{i}"))
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        if !exec.try_tick() {
                            thread::sleep(IDLE_BACKOFF);
                        }
                    }
                });

            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => tracing::error!("Failed to spawn task pool thread {i}: {e}"),
            }
        }

        tracing::debug!("TaskPool created with {} threads", threads.len());

        Self {
            executor,
            threads,
            shutdown,
        }
    }

    /// Create a pool using every available core.
    pub fn with_num_cpus() -> Self {
        Self::new(num_cpus::get())
    }

    /// Create a pool with `max(1, num_cpus - 1)` workers, leaving a core to the
    /// render thread.
    pub fn default_threads() -> Self {
        Self::new(num_cpus::get().saturating_sub(1).max(1))
    }

    /// Spawn a future on the pool. Dropping the returned [`Task`] cancels it; call
    /// [`Task::detach`] to let it run unobserved.
    pub fn spawn<T>(&self, future: impl Future<Output = T> + Send + 'static) -> Task<T>
    where
        T: Send + 'static,
    {
        self.executor.spawn(future)
    }

    /// Block the current thread until `future` completes, helping the workers run
    /// queued tasks meanwhile.
    pub fn block_on<T>(&self, future: impl Future<Output = T>) -> T {
        futures_lite::future::block_on(self.executor.run(future))
    }

    /// Number of live worker threads.
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Stop the workers and join them. Tasks still queued are dropped.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.shutdown.store(true, Ordering::Release);

        for handle in self.threads.drain(..) {
            if let Err(e) = handle.join() {
                tracing::error!("Task pool thread panicked: {:?}", e);
            }
        }
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::default_threads()
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("threads", &self.threads.len())
            .finish()
    }
}
