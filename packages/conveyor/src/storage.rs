//! Storage contract for the task state machine.
//!
//! The store is the sole owner of task row state. It decides what
//! "claimable" means, enforces every transition of the state machine,
//! and owns retry bookkeeping. Workers stay dumb: they claim, execute,
//! and report outcomes.
//!
//! # Implementer Notes
//!
//! - `claim_task` must be atomic with respect to concurrent workers:
//!   no two callers may observe themselves as owner of the same row.
//!   Use `FOR UPDATE SKIP LOCKED` (PostgreSQL) or equivalent; the
//!   in-memory reference store serializes claims behind its write lock.
//! - Claiming sets `locked_until = now + lock_duration` and
//!   `locked_by = worker_id`; expired locks make the row claimable
//!   again so work survives dead or partitioned workers.
//! - Retry delay calculation lives in `fail_task`, not in the worker.
//! - Implementations may offer outbox-style transactional enqueue by
//!   accepting a caller-supplied transaction handle at construction;
//!   the contract itself is transaction-agnostic.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::QueueError;
use crate::task::Task;

/// Durable repository of tasks and the dead-letter table.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Insert a new task. Rejects a duplicate id with
    /// [`QueueError::DuplicateTaskId`].
    async fn create_task(&self, task: Task) -> Result<(), QueueError>;

    /// Atomically select and lock the next eligible task.
    ///
    /// Eligible rows are `pending`, due (`scheduled_at <= now`), in one
    /// of `queues`, and not under an unexpired lock. Among those, the
    /// highest priority wins; ties break by earliest `scheduled_at`.
    ///
    /// Returns [`QueueError::NoTaskToClaim`] when nothing is eligible.
    async fn claim_task(
        &self,
        worker_id: &str,
        queues: &[String],
        lock_duration: Duration,
    ) -> Result<Task, QueueError>;

    /// Transition `processing -> completed`, setting `processed_at`
    /// and clearing the lock. Rejects tasks in any other status.
    async fn complete_task(&self, task_id: Uuid) -> Result<(), QueueError>;

    /// Record a failure on a `processing` task.
    ///
    /// With retries remaining the task flips back to `pending` with
    /// `scheduled_at = now + backoff(retry_count)`; otherwise it
    /// becomes `failed`. Either way the retry count is incremented,
    /// the error message stored, and the lock cleared.
    async fn fail_task(&self, task_id: Uuid, error_msg: &str) -> Result<(), QueueError>;

    /// Copy the task into the dead-letter table and delete the
    /// original row. The task's last error is copied onto the
    /// dead-letter entry unconditionally.
    async fn move_to_dlq(&self, task_id: Uuid) -> Result<(), QueueError>;

    /// Push `locked_until` forward on a `processing` task so a
    /// legitimately long handler keeps its exclusive claim.
    async fn extend_lock(&self, task_id: Uuid, duration: Duration) -> Result<(), QueueError>;

    /// Look up a pending task by name. This is the scheduler's
    /// idempotency probe: at most one pending instance per periodic
    /// task name may exist.
    async fn get_pending_task_by_name(&self, task_name: &str)
        -> Result<Option<Task>, QueueError>;
}
