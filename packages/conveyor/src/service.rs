//! Service orchestrator composing enqueuer, worker, and scheduler.
//!
//! The service owns a strict configure→run→stopped lifecycle:
//!
//! ```text
//! configuring ──► running ──► stopped
//!      │             │
//!      │             └─ registration rejected
//!      └─ register handlers / scheduled tasks, then Run
//! ```
//!
//! Components start conditionally: with no handlers registered the
//! worker is skipped (enqueue still works), and with no scheduled
//! tasks the scheduler is skipped. The `require_*` flags turn an empty
//! registry into a fail-fast error instead. A readiness signal fires
//! once every conditionally-enabled component has been launched, so
//! callers and tests never need sleep-based synchronization.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use crate::enqueue::{EnqueueOptions, Enqueuer};
use crate::error::QueueError;
use crate::handler::{Handler, HandlerRegistry};
use crate::schedule::Schedule;
use crate::scheduler::{PeriodicTaskOptions, Scheduler, SchedulerConfig};
use crate::storage::Storage;
use crate::task::{DEFAULT_PRIORITY, DEFAULT_QUEUE, MAX_PRIORITY};
use crate::worker::{Worker, WorkerConfig, WorkerMetrics};

/// Lifecycle phase of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Configuring,
    Running,
    Stopped,
}

/// Hook run before any component starts; an error aborts `run`.
pub type BeforeStartHook = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Hook run exactly once after all components have exited.
pub type AfterStopHook = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Configuration surface seeding all three components.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    // Worker
    pub queues: Vec<String>,
    pub poll_interval: Duration,
    pub lock_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub max_concurrent: usize,
    // Scheduler
    pub check_interval: Duration,
    // Enqueuer defaults
    pub default_queue: String,
    pub default_priority: i16,
    // Startup policy
    pub skip_worker_if_no_handlers: bool,
    pub skip_scheduler_if_no_tasks: bool,
    pub require_handlers: bool,
    pub require_scheduled_tasks: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            queues: vec![DEFAULT_QUEUE.to_string()],
            poll_interval: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(5 * 60),
            shutdown_timeout: Duration::from_secs(30),
            max_concurrent: 1,
            check_interval: Duration::from_secs(30),
            default_queue: DEFAULT_QUEUE.to_string(),
            default_priority: DEFAULT_PRIORITY,
            skip_worker_if_no_handlers: true,
            skip_scheduler_if_no_tasks: true,
            require_handlers: false,
            require_scheduled_tasks: false,
        }
    }
}

impl ServiceConfig {
    /// Replace zero or invalid values with defaults so partial configs
    /// merge cleanly.
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
        if self.check_interval.is_zero() {
            self.check_interval = defaults.check_interval;
        }
        if self.default_queue.is_empty() {
            self.default_queue = defaults.default_queue;
        }
        if !(0..=MAX_PRIORITY).contains(&self.default_priority) {
            self.default_priority = defaults.default_priority;
        }
        self
    }
}

/// Builder for [`Service`]; storage is the only required input.
#[derive(Default)]
pub struct ServiceBuilder {
    storage: Option<Arc<dyn Storage>>,
    config: ServiceConfig,
    before_start: Option<BeforeStartHook>,
    after_stop: Option<AfterStopHook>,
}

impl ServiceBuilder {
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Run before any component starts; an error aborts `run`.
    pub fn before_start<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.before_start = Some(Box::new(move || Box::pin(hook())));
        self
    }

    /// Run exactly once after all components have exited.
    pub fn after_stop<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.after_stop = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Result<Service, QueueError> {
        let storage = self.storage.ok_or(QueueError::RepositoryNil)?;
        let config = self.config.normalized();

        let handlers = Arc::new(HandlerRegistry::new());
        let worker = Worker::with_config(
            Arc::clone(&storage),
            Arc::clone(&handlers),
            WorkerConfig {
                queues: config.queues.clone(),
                poll_interval: config.poll_interval,
                lock_timeout: config.lock_timeout,
                shutdown_timeout: config.shutdown_timeout,
                max_concurrent: config.max_concurrent,
                worker_id: format!("worker-{}", Uuid::new_v4()),
            },
        );
        let scheduler = Scheduler::with_config(
            Arc::clone(&storage),
            SchedulerConfig {
                check_interval: config.check_interval,
                shutdown_timeout: config.shutdown_timeout,
            },
        );
        let enqueuer = Enqueuer::new(Arc::clone(&storage))
            .with_defaults(config.default_queue.clone(), config.default_priority);

        let (state_tx, state_rx) = watch::channel(ServiceState::Configuring);
        let (ready_tx, ready_rx) = watch::channel(false);

        Ok(Service {
            enqueuer,
            handlers,
            worker,
            scheduler,
            config,
            state_tx,
            state_rx,
            ready_tx,
            ready_rx,
            shutdown: CancellationToken::new(),
            before_start: self.before_start,
            after_stop: Mutex::new(self.after_stop),
            worker_enabled: AtomicBool::new(false),
            scheduler_enabled: AtomicBool::new(false),
        })
    }
}

/// Composed task-queue service with a configure→run→stopped lifecycle.
pub struct Service {
    enqueuer: Enqueuer,
    handlers: Arc<HandlerRegistry>,
    worker: Worker,
    scheduler: Scheduler,
    config: ServiceConfig,
    state_tx: watch::Sender<ServiceState>,
    state_rx: watch::Receiver<ServiceState>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    shutdown: CancellationToken,
    before_start: Option<BeforeStartHook>,
    after_stop: Mutex<Option<AfterStopHook>>,
    worker_enabled: AtomicBool,
    scheduler_enabled: AtomicBool,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service").finish_non_exhaustive()
    }
}

impl Service {
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder {
            storage: None,
            config: ServiceConfig::default(),
            before_start: None,
            after_stop: None,
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state_rx.borrow()
    }

    /// The enqueuer bound to this service's storage and defaults.
    /// Usable in every lifecycle state.
    pub fn enqueuer(&self) -> Enqueuer {
        self.enqueuer.clone()
    }

    /// Enqueue a one-time task through the service's enqueuer.
    pub async fn enqueue<T: serde::Serialize>(
        &self,
        payload: &T,
        options: EnqueueOptions,
    ) -> Result<Uuid, QueueError> {
        self.enqueuer.enqueue(payload, options).await
    }

    /// Register a handler. Permitted only while configuring.
    pub fn register_handler(&self, handler: Arc<dyn Handler>) -> Result<(), QueueError> {
        if self.state() != ServiceState::Configuring {
            return Err(QueueError::ServiceNotConfiguring);
        }
        self.handlers.register(handler);
        Ok(())
    }

    /// Register a periodic task. Permitted only while configuring.
    pub fn add_scheduled_task(
        &self,
        name: impl Into<String>,
        schedule: Schedule,
        options: PeriodicTaskOptions,
    ) -> Result<(), QueueError> {
        if self.state() != ServiceState::Configuring {
            return Err(QueueError::ServiceNotConfiguring);
        }
        self.scheduler.add_task(name, schedule, options)
    }

    /// Completes once all conditionally-enabled components have been
    /// launched by `run`.
    pub async fn ready(&self) {
        let mut rx = self.ready_rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Run the composed service until `ctx` is cancelled or a
    /// component fails intrinsically.
    ///
    /// Returns `Ok(())` on clean cancellation, the first component
    /// error otherwise, and the `after_stop` error if only the hook
    /// failed.
    pub async fn run(&self, ctx: CancellationToken) -> Result<(), QueueError> {
        self.transition_to_running()?;

        if let Some(hook) = &self.before_start {
            if let Err(e) = hook().await {
                error!(error = %e, "before_start hook failed, aborting run");
                self.set_stopped();
                return Err(QueueError::Hook(format!("before_start: {e}")));
            }
        }

        let has_handlers = !self.handlers.is_empty();
        let has_tasks = self.scheduler.task_count() > 0;

        if self.config.require_handlers && !has_handlers {
            self.set_stopped();
            return Err(QueueError::NoHandlers);
        }
        if self.config.require_scheduled_tasks && !has_tasks {
            self.set_stopped();
            return Err(QueueError::NoTasksRegistered);
        }

        let start_worker = has_handlers || !self.config.skip_worker_if_no_handlers;
        let start_scheduler = has_tasks || !self.config.skip_scheduler_if_no_tasks;
        self.worker_enabled.store(start_worker, Ordering::SeqCst);
        self.scheduler_enabled
            .store(start_scheduler, Ordering::SeqCst);

        // Cancellation cascades from the caller's context and from
        // Stop into one token shared by both components.
        let run_token = ctx.child_token();
        let stop_forwarder = {
            let stop = self.shutdown.clone();
            let run_token = run_token.clone();
            tokio::spawn(async move {
                stop.cancelled().await;
                run_token.cancel();
            })
        };

        let mut components: JoinSet<Result<(), QueueError>> = JoinSet::new();
        if start_worker {
            let worker = self.worker.clone();
            let token = run_token.clone();
            components.spawn(async move { worker.run(token).await });
        } else {
            info!("no handlers registered, worker not started");
        }
        if start_scheduler {
            let scheduler = self.scheduler.clone();
            let token = run_token.clone();
            components.spawn(async move { scheduler.run(token).await });
        } else {
            info!("no scheduled tasks registered, scheduler not started");
        }

        // Every conditionally-enabled component has been launched.
        let _ = self.ready_tx.send(true);
        info!(
            worker = start_worker,
            scheduler = start_scheduler,
            "service running"
        );

        let mut first_err: Option<QueueError> = None;
        if components.is_empty() {
            // Nothing to supervise; stay up for enqueue until cancelled.
            run_token.cancelled().await;
        }
        while let Some(joined) = components.join_next().await {
            let component_err = match joined {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(e) => Some(QueueError::Component(format!("component task failed: {e}"))),
            };
            if let Some(e) = component_err {
                if first_err.is_none() {
                    first_err = Some(e);
                }
                // First failure cascades to the remaining component.
                run_token.cancel();
            }
        }
        stop_forwarder.abort();

        self.set_stopped();
        let hook_err = self.run_after_stop();

        match first_err {
            Some(e) => Err(e),
            None => match hook_err {
                Some(e) => Err(QueueError::Hook(format!("after_stop: {e}"))),
                None => Ok(()),
            },
        }
    }

    /// Cancel the running components and wait for `run` to return.
    ///
    /// Safe to call from any state; in `configuring` the service moves
    /// straight to `stopped` and the `after_stop` hook still runs
    /// exactly once.
    pub async fn stop(&self) -> Result<(), QueueError> {
        self.shutdown.cancel();

        match self.state() {
            ServiceState::Running => {
                let mut rx = self.state_rx.clone();
                let wait = async move {
                    loop {
                        if *rx.borrow_and_update() == ServiceState::Stopped {
                            return;
                        }
                        if rx.changed().await.is_err() {
                            return;
                        }
                    }
                };
                match tokio::time::timeout(self.config.shutdown_timeout, wait).await {
                    Ok(()) => Ok(()),
                    Err(_) => Err(QueueError::ShutdownTimeoutExceeded),
                }
            }
            ServiceState::Configuring => {
                self.set_stopped();
                if let Some(e) = self.run_after_stop() {
                    return Err(QueueError::Hook(format!("after_stop: {e}")));
                }
                Ok(())
            }
            ServiceState::Stopped => Ok(()),
        }
    }

    /// Composite health probe over the enabled components.
    pub fn healthcheck(&self) -> Result<(), QueueError> {
        if self.state() != ServiceState::Running {
            return Err(QueueError::WorkerNotRunning.into_healthcheck_failure());
        }
        if self.worker_enabled.load(Ordering::SeqCst) {
            self.worker.healthcheck()?;
        }
        if self.scheduler_enabled.load(Ordering::SeqCst) {
            self.scheduler.healthcheck()?;
        }
        Ok(())
    }

    /// Worker statistics; zeros before the worker has started.
    pub fn worker_metrics(&self) -> WorkerMetrics {
        self.worker.metrics()
    }

    fn transition_to_running(&self) -> Result<(), QueueError> {
        let moved = self.state_tx.send_if_modified(|state| {
            if *state == ServiceState::Configuring {
                *state = ServiceState::Running;
                true
            } else {
                false
            }
        });
        if moved {
            return Ok(());
        }
        match self.state() {
            ServiceState::Running => Err(QueueError::ServiceAlreadyRunning),
            _ => Err(QueueError::ServiceNotConfiguring),
        }
    }

    fn set_stopped(&self) {
        let _ = self.state_tx.send(ServiceState::Stopped);
    }

    fn run_after_stop(&self) -> Option<anyhow::Error> {
        let hook = self
            .after_stop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match hook {
            Some(hook) => match hook() {
                Ok(()) => None,
                Err(e) => {
                    error!(error = %e, "after_stop hook failed");
                    Some(e)
                }
            },
            None => None,
        }
    }
}
