//! Worker service that claims and executes tasks.
//!
//! The worker is a long-running loop:
//!
//! ```text
//! Worker
//!     │
//!     ├─► tick: reserve a concurrency slot (skip tick if none free)
//!     ├─► claim one task via Storage
//!     ├─► dispatch to the registered handler (deadline = lock_timeout)
//!     └─► record outcome: complete, retry with backoff, or dead-letter
//! ```
//!
//! Handlers run with an independent deadline rather than under the
//! worker's shutdown signal: graceful shutdown never aborts in-flight
//! tasks, it waits for them up to `shutdown_timeout`. Panics inside
//! handlers are intercepted and funneled through the normal failure
//! path, so a misbehaving task can never take the worker down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::handler::{HandlerRegistry, TaskContext};
use crate::storage::Storage;
use crate::task::{Task, DEFAULT_QUEUE};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_CONCURRENT: usize = 1;

/// Configuration for the worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queues this worker claims from.
    pub queues: Vec<String>,
    /// How often to look for claimable work.
    pub poll_interval: Duration,
    /// Exclusive-lock budget per claimed task; also the handler deadline.
    pub lock_timeout: Duration,
    /// How long shutdown waits for in-flight tasks.
    pub shutdown_timeout: Duration,
    /// Concurrency slot count.
    pub max_concurrent: usize,
    /// Identifier recorded as `locked_by` on claims.
    pub worker_id: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec![DEFAULT_QUEUE.to_string()],
            poll_interval: DEFAULT_POLL_INTERVAL,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl WorkerConfig {
    /// Replace zero or empty values with defaults, allowing partial
    /// configs to merge cleanly.
    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        self.queues.retain(|q| !q.is_empty());
        if self.queues.is_empty() {
            self.queues = defaults.queues;
        }
        if self.poll_interval.is_zero() {
            self.poll_interval = defaults.poll_interval;
        }
        if self.lock_timeout.is_zero() {
            self.lock_timeout = defaults.lock_timeout;
        }
        if self.shutdown_timeout.is_zero() {
            self.shutdown_timeout = defaults.shutdown_timeout;
        }
        if self.max_concurrent == 0 {
            self.max_concurrent = defaults.max_concurrent;
        }
        if self.worker_id.is_empty() {
            self.worker_id = defaults.worker_id;
        }
        self
    }
}

/// Point-in-time worker statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerMetrics {
    pub tasks_processed: u64,
    pub tasks_failed: u64,
    pub active_tasks: usize,
    pub is_running: bool,
}

/// Running flag and in-flight unit count, guarded by one mutex so
/// "observe running" and "register unit" are atomic relative to
/// "clear running" during shutdown.
struct Inflight {
    running: bool,
    active: usize,
}

struct Inner {
    storage: Arc<dyn Storage>,
    handlers: Arc<HandlerRegistry>,
    config: WorkerConfig,
    semaphore: Arc<Semaphore>,
    inflight: Mutex<Inflight>,
    drained: Notify,
    tasks_processed: AtomicU64,
    tasks_failed: AtomicU64,
}

impl Inner {
    fn inflight(&self) -> MutexGuard<'_, Inflight> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a task-processing unit; refused once shutdown has
    /// cleared the running flag.
    fn try_register(&self) -> bool {
        let mut guard = self.inflight();
        if !guard.running {
            return false;
        }
        guard.active += 1;
        true
    }

    fn deregister(&self) {
        let mut guard = self.inflight();
        guard.active = guard.active.saturating_sub(1);
        if guard.active == 0 {
            self.drained.notify_waiters();
        }
    }
}

/// Deregisters the unit on drop, even if processing panics.
struct UnitGuard(Arc<Inner>);

impl Drop for UnitGuard {
    fn drop(&mut self) {
        self.0.deregister();
    }
}

/// Long-running task processor with bounded concurrency.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

impl Worker {
    pub fn new(storage: Arc<dyn Storage>, handlers: Arc<HandlerRegistry>) -> Self {
        Self::with_config(storage, handlers, WorkerConfig::default())
    }

    pub fn with_config(
        storage: Arc<dyn Storage>,
        handlers: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        let config = config.normalized();
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            inner: Arc::new(Inner {
                storage,
                handlers,
                config,
                semaphore,
                inflight: Mutex::new(Inflight {
                    running: false,
                    active: 0,
                }),
                drained: Notify::new(),
                tasks_processed: AtomicU64::new(0),
                tasks_failed: AtomicU64::new(0),
            }),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.config.worker_id
    }

    /// Run the claim loop until `shutdown` is cancelled, then drain
    /// in-flight tasks for up to `shutdown_timeout`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), QueueError> {
        {
            let mut guard = self.inner.inflight();
            if guard.running {
                return Err(QueueError::ServiceAlreadyRunning);
            }
            guard.running = true;
        }

        info!(
            worker_id = %self.inner.config.worker_id,
            queues = ?self.inner.config.queues,
            max_concurrent = self.inner.config.max_concurrent,
            "worker starting"
        );

        let mut interval = tokio::time::interval(self.inner.config.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.tick(),
            }
        }

        let result = self.drain().await;
        info!(worker_id = %self.inner.config.worker_id, "worker stopped");
        result
    }

    /// One poll tick: reserve a slot and spawn a processing unit, or
    /// skip when all slots are busy.
    fn tick(&self) {
        let Ok(permit) = Arc::clone(&self.inner.semaphore).try_acquire_owned() else {
            debug!(
                worker_id = %self.inner.config.worker_id,
                "all concurrency slots busy, skipping tick"
            );
            return;
        };

        if !self.inner.try_register() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _permit = permit;
            let _unit = UnitGuard(Arc::clone(&inner));
            process_one(inner).await;
        });
    }

    /// Wait for in-flight units after the loop has exited.
    async fn drain(&self) -> Result<(), QueueError> {
        let active = {
            let mut guard = self.inner.inflight();
            guard.running = false;
            guard.active
        };
        if active == 0 {
            return Ok(());
        }

        info!(count = active, "waiting for in-flight tasks to complete");

        let inner = Arc::clone(&self.inner);
        let wait = async move {
            loop {
                let notified = inner.drained.notified();
                if inner.inflight().active == 0 {
                    break;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(self.inner.config.shutdown_timeout, wait).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!(
                    worker_id = %self.inner.config.worker_id,
                    "shutdown timeout exceeded with tasks still in flight"
                );
                Err(QueueError::ShutdownTimeoutExceeded)
            }
        }
    }

    /// Push a processing task's lock forward; exposed for handlers
    /// doing legitimately long work.
    pub async fn extend_lock(&self, task_id: Uuid, duration: Duration) -> Result<(), QueueError> {
        self.inner.storage.extend_lock(task_id, duration).await
    }

    /// Healthy when running with at least one free concurrency slot.
    pub fn healthcheck(&self) -> Result<(), QueueError> {
        let guard = self.inner.inflight();
        if !guard.running {
            return Err(QueueError::WorkerNotRunning.into_healthcheck_failure());
        }
        if guard.active >= self.inner.config.max_concurrent {
            return Err(QueueError::WorkerOverloaded.into_healthcheck_failure());
        }
        Ok(())
    }

    pub fn metrics(&self) -> WorkerMetrics {
        let guard = self.inner.inflight();
        WorkerMetrics {
            tasks_processed: self.inner.tasks_processed.load(Ordering::Relaxed),
            tasks_failed: self.inner.tasks_failed.load(Ordering::Relaxed),
            active_tasks: guard.active,
            is_running: guard.running,
        }
    }
}

/// Claim and execute at most one task.
async fn process_one(inner: Arc<Inner>) {
    let claimed = match inner
        .storage
        .claim_task(
            &inner.config.worker_id,
            &inner.config.queues,
            inner.config.lock_timeout,
        )
        .await
    {
        Ok(task) => task,
        Err(QueueError::NoTaskToClaim) => return,
        Err(e) => {
            // Storage faults are non-fatal to the loop.
            error!(error = %e, "failed to claim task");
            return;
        }
    };

    debug!(
        task_id = %claimed.id,
        task_name = %claimed.task_name,
        queue = %claimed.queue,
        "claimed task"
    );

    dispatch(inner, claimed).await;
}

async fn dispatch(inner: Arc<Inner>, task: Task) {
    let Some(handler) = inner.handlers.get(&task.task_name) else {
        // Retries cannot succeed without code; retire immediately.
        let msg = format!("no handler registered for task type: {}", task.task_name);
        warn!(task_id = %task.id, task_name = %task.task_name, "{msg}");
        inner.tasks_failed.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = inner.storage.fail_task(task.id, &msg).await {
            error!(task_id = %task.id, error = %e, "failed to record task failure");
            return;
        }
        if let Err(e) = inner.storage.move_to_dlq(task.id).await {
            error!(task_id = %task.id, error = %e, "failed to move task to dead letter");
        }
        return;
    };

    // Fresh deadline independent of the worker's shutdown signal:
    // in-flight tasks get their full lock budget to finish.
    let deadline = CancellationToken::new();
    let ctx = TaskContext::new(&task, Arc::clone(&inner.storage), deadline.clone());
    let payload = task.payload.clone();
    let mut execution = tokio::spawn(async move { handler.handle(ctx, payload).await });

    let result: anyhow::Result<()> = tokio::select! {
        joined = &mut execution => match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                Err(anyhow::anyhow!("panic: {}", panic_message(e.into_panic())))
            }
            Err(e) => Err(anyhow::anyhow!("task execution aborted: {e}")),
        },
        _ = tokio::time::sleep(inner.config.lock_timeout) => {
            deadline.cancel();
            execution.abort();
            Err(anyhow::anyhow!(
                "task execution exceeded lock timeout of {:?}",
                inner.config.lock_timeout
            ))
        }
    };

    match result {
        Ok(()) => {
            if let Err(e) = inner.storage.complete_task(task.id).await {
                error!(task_id = %task.id, error = %e, "failed to mark task as completed");
                return;
            }
            inner.tasks_processed.fetch_add(1, Ordering::Relaxed);
            debug!(task_id = %task.id, task_name = %task.task_name, "task completed");
        }
        Err(e) => {
            let msg = e.to_string();
            warn!(
                task_id = %task.id,
                task_name = %task.task_name,
                error = %msg,
                "task failed"
            );
            inner.tasks_failed.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = inner.storage.fail_task(task.id, &msg).await {
                error!(task_id = %task.id, error = %e, "failed to record task failure");
                return;
            }
            if task.retries_exhausted_on_next_failure() {
                if let Err(e) = inner.storage.move_to_dlq(task.id).await {
                    error!(task_id = %task.id, error = %e, "failed to move task to dead letter");
                }
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
