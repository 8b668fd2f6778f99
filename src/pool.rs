//! Bounded worker pool for connection handler tasks.
//!
//! Every submitted task is spawned on the tokio runtime right away, but
//! parks on a semaphore permit before it runs. The number of permits is
//! the pool size, so at most `size` tasks make progress at once and the
//! rest queue in FIFO order on the semaphore. The backlog is unbounded.
//!
//! Shutdown follows the executor model:
//! - `shutdown()` rejects new submissions and lets queued and running
//!   tasks finish.
//! - `force_shutdown()` additionally aborts every outstanding task. An
//!   abort only lands at the task's next yield point.
//! - `await_termination()` waits until shutdown was requested and no task
//!   is outstanding.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::{debug, trace};

/// Handle to a pool of bounded execution slots.
///
/// Cloning is cheap and every clone refers to the same pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    size: usize,
    slots: Arc<Semaphore>,
    shutdown: AtomicBool,
    next_task: AtomicU64,
    running: AtomicUsize,
    /// Outstanding tasks (queued or running), keyed by task id.
    tasks: Mutex<HashMap<u64, AbortHandle>>,
    /// Signalled when the last outstanding task leaves and on shutdown.
    idle: Notify,
}

impl PoolInner {
    fn tasks(&self) -> MutexGuard<'_, HashMap<u64, AbortHandle>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WorkerPool {
    /// Create a pool with `size` execution slots (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                size,
                slots: Arc::new(Semaphore::new(size)),
                shutdown: AtomicBool::new(false),
                next_task: AtomicU64::new(0),
                running: AtomicUsize::new(0),
                tasks: Mutex::new(HashMap::new()),
                idle: Notify::new(),
            }),
        }
    }

    /// Submit a task for execution.
    ///
    /// Returns the task back inside [`Rejected`] once shutdown has been
    /// requested, so the caller decides where it gets dropped.
    pub fn submit<F>(&self, task: F) -> Result<TaskHandle, Rejected<F>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // The tasks lock is held across spawn and insert, so a task that
        // completes immediately cannot deregister before it is registered.
        let mut tasks = self.inner.tasks();
        if self.is_shutdown() {
            return Err(Rejected(task));
        }

        let id = self.inner.next_task.fetch_add(1, Ordering::Relaxed);
        let slots = Arc::clone(&self.inner.slots);
        let exit = TaskExit {
            pool: Arc::clone(&self.inner),
            id,
        };

        let handle = tokio::spawn(async move {
            let _exit = exit;
            let Ok(_permit) = slots.acquire_owned().await else {
                return;
            };
            let _running = RunningSlot::enter(&_exit.pool);
            task.await;
        });

        tasks.insert(id, handle.abort_handle());
        trace!(task = id, outstanding = tasks.len(), "Task submitted");

        Ok(TaskHandle { id, handle })
    }

    /// Stop accepting submissions. Queued and running tasks still run.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.swap(true, Ordering::AcqRel) {
            debug!(outstanding = self.outstanding(), "Worker pool shutting down");
        }
        self.inner.idle.notify_waiters();
    }

    /// Stop accepting submissions and abort every outstanding task.
    ///
    /// Returns how many tasks were signalled.
    pub fn force_shutdown(&self) -> usize {
        self.inner.shutdown.store(true, Ordering::Release);
        let tasks = self.inner.tasks();
        for handle in tasks.values() {
            handle.abort();
        }
        let signalled = tasks.len();
        drop(tasks);

        debug!(signalled, "Worker pool forced shutdown");
        self.inner.idle.notify_waiters();
        signalled
    }

    /// Wait up to `timeout` for the pool to terminate.
    ///
    /// Returns `true` if shutdown was requested and every task has exited.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.terminated()).await.is_ok()
    }

    async fn terminated(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_terminated() {
                return;
            }
            notified.await;
        }
    }

    /// Number of execution slots.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Number of tasks submitted that have not exited yet.
    pub fn outstanding(&self) -> usize {
        self.inner.tasks().len()
    }

    /// Number of tasks currently holding a slot.
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.is_shutdown() && self.outstanding() == 0
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size())
            .field("running", &self.running())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Completion handle for a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    id: u64,
    handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the task has exited, normally or by abort.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the task to exit.
    pub async fn join(self) -> Result<(), JoinError> {
        self.handle.await
    }
}

/// A task refused because the pool is shut down.
pub struct Rejected<F>(pub F);

impl<F> Rejected<F> {
    pub fn into_inner(self) -> F {
        self.0
    }
}

impl<F> std::fmt::Debug for Rejected<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Rejected(..)")
    }
}

impl<F> std::fmt::Display for Rejected<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker pool is shut down")
    }
}

impl<F> std::error::Error for Rejected<F> {}

/// Deregisters a task when its future is dropped, whether it ran to
/// completion, was aborted while running, or was aborted while queued.
struct TaskExit {
    pool: Arc<PoolInner>,
    id: u64,
}

impl Drop for TaskExit {
    fn drop(&mut self) {
        let mut tasks = self.pool.tasks();
        tasks.remove(&self.id);
        let empty = tasks.is_empty();
        drop(tasks);

        trace!(task = self.id, "Task exited");
        if empty {
            self.pool.idle.notify_waiters();
        }
    }
}

struct RunningSlot<'a>(&'a PoolInner);

impl<'a> RunningSlot<'a> {
    fn enter(pool: &'a PoolInner) -> Self {
        pool.running.fetch_add(1, Ordering::AcqRel);
        Self(pool)
    }
}

impl Drop for RunningSlot<'_> {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::AcqRel);
    }
}
