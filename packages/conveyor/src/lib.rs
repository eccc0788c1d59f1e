//! # Conveyor
//!
//! A durable background task queue with three cooperating roles: an
//! enqueuer that submits work, a worker pool that claims and executes
//! it with retry and dead-letter semantics, and a periodic scheduler
//! that materializes recurring tasks.
//!
//! ## Architecture
//!
//! ```text
//! Enqueuer.enqueue(payload)
//!     │
//!     ▼ create_task (pending)
//! Storage ◄──────────────────────────────┐
//!     ▲                                  │
//!     │ claim_task (atomic, priority)    │ get_pending_task_by_name
//!     │                                  │ create_task (periodic)
//! Worker loop                       Scheduler tick
//!     │                                  ▲
//!     ├─► Handler.handle(ctx, payload)   │ Schedule.next(from)
//!     │                                  │
//!     └─► complete / fail+backoff / dead letter
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Storage owns task state** - workers never write task fields
//!    directly; every transition goes through the storage contract
//! 2. **Claims are exclusive** - no two workers ever own the same row;
//!    expired locks return work to the pool
//! 3. **Retries are bounded** - a task failing `max_retries` times is
//!    retired to the dead-letter queue with its last error
//! 4. **Periodic tasks are idempotent** - at most one pending instance
//!    per registered name, across restarts and processes
//! 5. **Shutdown is graceful** - in-flight handlers get their full
//!    lock budget; shutdown waits for them up to a timeout
//!
//! ## Example
//!
//! ```ignore
//! use conveyor::{
//!     task_handler, EnqueueOptions, MemoryStorage, PeriodicTaskOptions, Schedule, Service,
//! };
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Serialize, Deserialize)]
//! struct SendEmail {
//!     to: String,
//! }
//!
//! let service = Service::builder()
//!     .storage(Arc::new(MemoryStorage::new()))
//!     .build()?;
//!
//! service.register_handler(task_handler(|_ctx, email: SendEmail| async move {
//!     mailer.send(&email.to).await
//! }))?;
//! service.add_scheduled_task("reports::nightly", Schedule::daily_at(2, 0),
//!     PeriodicTaskOptions::new())?;
//!
//! service.enqueue(&SendEmail { to: "ada@example.com".into() },
//!     EnqueueOptions::new()).await?;
//!
//! service.run(CancellationToken::new()).await?;
//! ```

mod enqueue;
mod error;
mod handler;
mod memory;
mod schedule;
mod scheduler;
mod service;
mod storage;
mod task;
mod worker;

pub use enqueue::{EnqueueOptions, Enqueuer};
pub use error::QueueError;
pub use handler::{
    periodic_handler, task_handler, task_name_for, Handler, HandlerRegistry, TaskContext,
};
pub use memory::MemoryStorage;
pub use schedule::Schedule;
pub use scheduler::{PeriodicTaskOptions, Scheduler, SchedulerConfig};
pub use service::{
    AfterStopHook, BeforeStartHook, Service, ServiceBuilder, ServiceConfig, ServiceState,
};
pub use storage::Storage;
pub use task::{
    retry_backoff, DeadTask, Task, TaskStatus, TaskType, DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY,
    DEFAULT_QUEUE, MAX_PRIORITY, MAX_RETRIES_LIMIT,
};
pub use worker::{Worker, WorkerConfig, WorkerMetrics};
