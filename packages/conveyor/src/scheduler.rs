//! Periodic scheduler that materializes recurring tasks.
//!
//! The scheduler never executes anything. On each tick it walks the
//! registered periodic tasks and, for each one that is due, creates at
//! most one pending task instance:
//!
//! ```text
//! Scheduler tick (immediate at start, then every check_interval)
//!     │
//!     ├─► next_run from the schedule and last materialization
//!     ├─► skip when not due
//!     ├─► get_pending_task_by_name  (idempotency probe)
//!     │       └─► pending row exists → adopt its scheduled_at, skip
//!     └─► create pending periodic task at next_run
//! ```
//!
//! The idempotency probe is what prevents duplicate periodic instances
//! across restarts and multi-process deployments: a pending instance
//! already in storage, whoever created it, counts as this period's
//! materialization.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::QueueError;
use crate::schedule::Schedule;
use crate::storage::Storage;
use crate::task::{Task, DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY, DEFAULT_QUEUE, MAX_PRIORITY};

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to sweep the registered tasks.
    pub check_interval: Duration,
    /// How long shutdown waits for in-flight sweeps.
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl SchedulerConfig {
    fn normalized(mut self) -> Self {
        if self.check_interval.is_zero() {
            self.check_interval = DEFAULT_CHECK_INTERVAL;
        }
        if self.shutdown_timeout.is_zero() {
            self.shutdown_timeout = DEFAULT_SHUTDOWN_TIMEOUT;
        }
        self
    }
}

/// Options for a registered periodic task.
#[derive(Debug, Clone, Default)]
pub struct PeriodicTaskOptions {
    pub queue: Option<String>,
    pub priority: Option<i16>,
    pub max_retries: Option<i32>,
}

impl PeriodicTaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_priority(mut self, priority: i16) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

#[derive(Debug, Clone)]
struct RegisteredTask {
    schedule: Schedule,
    queue: String,
    priority: i16,
    max_retries: i32,
    last_scheduled_at: Option<DateTime<Utc>>,
}

struct Inflight {
    running: bool,
    active: usize,
}

struct Inner {
    storage: Arc<dyn Storage>,
    config: SchedulerConfig,
    tasks: RwLock<HashMap<String, RegisteredTask>>,
    inflight: Mutex<Inflight>,
    drained: Notify,
}

impl Inner {
    fn inflight(&self) -> MutexGuard<'_, Inflight> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_register_tick(&self) -> bool {
        let mut guard = self.inflight();
        if !guard.running {
            return false;
        }
        guard.active += 1;
        true
    }

    fn deregister_tick(&self) {
        let mut guard = self.inflight();
        guard.active = guard.active.saturating_sub(1);
        if guard.active == 0 {
            self.drained.notify_waiters();
        }
    }

    fn set_last_scheduled(&self, name: &str, at: DateTime<Utc>) {
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = tasks.get_mut(name) {
            task.last_scheduled_at = Some(at);
        }
    }
}

struct TickGuard(Arc<Inner>);

impl Drop for TickGuard {
    fn drop(&mut self) {
        self.0.deregister_tick();
    }
}

/// Long-running loop materializing registered periodic tasks.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_config(storage, SchedulerConfig::default())
    }

    pub fn with_config(storage: Arc<dyn Storage>, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                config: config.normalized(),
                tasks: RwLock::new(HashMap::new()),
                inflight: Mutex::new(Inflight {
                    running: false,
                    active: 0,
                }),
                drained: Notify::new(),
            }),
        }
    }

    /// Register a periodic task under a unique name.
    ///
    /// Options default to the default queue, priority 50, and three
    /// retries. A duplicate name is rejected.
    pub fn add_task(
        &self,
        name: impl Into<String>,
        schedule: Schedule,
        options: PeriodicTaskOptions,
    ) -> Result<(), QueueError> {
        let name = name.into();
        let mut tasks = self.inner.tasks.write().unwrap_or_else(|e| e.into_inner());
        if tasks.contains_key(&name) {
            return Err(QueueError::TaskAlreadyRegistered(name));
        }

        let registered = RegisteredTask {
            schedule,
            queue: options
                .queue
                .filter(|q| !q.is_empty())
                .unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            priority: options
                .priority
                .filter(|p| (0..=MAX_PRIORITY).contains(p))
                .unwrap_or(DEFAULT_PRIORITY),
            max_retries: options
                .max_retries
                .unwrap_or(DEFAULT_MAX_RETRIES)
                .clamp(0, crate::task::MAX_RETRIES_LIMIT),
            last_scheduled_at: None,
        };

        debug!(task_name = %name, schedule = %schedule, "periodic task registered");
        tasks.insert(name, registered);
        Ok(())
    }

    pub fn task_count(&self) -> usize {
        self.inner
            .tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn task_names(&self) -> Vec<String> {
        self.inner
            .tasks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.inner.inflight().running
    }

    /// Healthy while the tick loop is running.
    pub fn healthcheck(&self) -> Result<(), QueueError> {
        if !self.is_running() {
            return Err(QueueError::SchedulerNotRunning.into_healthcheck_failure());
        }
        Ok(())
    }

    /// Run the tick loop until `shutdown` is cancelled, then wait for
    /// in-flight sweeps up to `shutdown_timeout`.
    ///
    /// A scheduler with no registered tasks idles; registration is only
    /// possible before the service runs, so an empty scheduler stays
    /// empty until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), QueueError> {
        {
            let mut guard = self.inner.inflight();
            if guard.running {
                return Err(QueueError::ServiceAlreadyRunning);
            }
            guard.running = true;
        }

        info!(
            task_count = self.task_count(),
            check_interval_secs = self.inner.config.check_interval.as_secs(),
            "scheduler starting"
        );

        // The first tick fires immediately.
        let mut interval = tokio::time::interval(self.inner.config.check_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.spawn_tick(),
            }
        }

        let result = self.drain().await;
        info!("scheduler stopped");
        result
    }

    /// Ticks run under a wait-group; a slow sweep does not delay the
    /// next one.
    fn spawn_tick(&self) {
        if !self.inner.try_register_tick() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _tick = TickGuard(Arc::clone(&inner));
            run_tick(inner).await;
        });
    }

    async fn drain(&self) -> Result<(), QueueError> {
        let active = {
            let mut guard = self.inner.inflight();
            guard.running = false;
            guard.active
        };
        if active == 0 {
            return Ok(());
        }

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
                warn!("scheduler shutdown timeout exceeded with sweeps in flight");
                Err(QueueError::ShutdownTimeoutExceeded)
            }
        }
    }
}

/// One sweep over a snapshot of the registered tasks. Errors are
/// logged per task; the sweep always visits every task.
async fn run_tick(inner: Arc<Inner>) {
    let snapshot: Vec<(String, RegisteredTask)> = {
        let tasks = inner.tasks.read().unwrap_or_else(|e| e.into_inner());
        tasks
            .iter()
            .map(|(name, task)| (name.clone(), task.clone()))
            .collect()
    };

    let now = Utc::now();
    for (name, registered) in snapshot {
        let next_run = match registered.last_scheduled_at {
            Some(last) => registered.schedule.next(last),
            None => registered.schedule.next(now),
        };

        if registered.last_scheduled_at.is_some() && next_run > now {
            continue; // not due yet
        }

        match inner.storage.get_pending_task_by_name(&name).await {
            Ok(Some(pending)) => {
                // Someone already materialized this period; adopt it.
                debug!(
                    task_name = %name,
                    scheduled_at = %pending.scheduled_at,
                    "pending instance exists, skipping creation"
                );
                inner.set_last_scheduled(&name, pending.scheduled_at);
            }
            Ok(None) => {
                let task = Task::periodic(
                    registered.queue.clone(),
                    name.clone(),
                    registered.priority,
                    registered.max_retries,
                    next_run,
                );
                match inner.storage.create_task(task).await {
                    Ok(()) => {
                        info!(
                            task_name = %name,
                            schedule = %registered.schedule,
                            next_run = %next_run,
                            "periodic task scheduled"
                        );
                        inner.set_last_scheduled(&name, next_run);
                    }
                    Err(e) => {
                        error!(task_name = %name, error = %e, "failed to create periodic task");
                    }
                }
            }
            Err(e) => {
                error!(task_name = %name, error = %e, "failed to probe pending task");
            }
        }
    }
}
