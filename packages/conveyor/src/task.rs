//! Task model for durable background work.
//!
//! A [`Task`] is the unit of work traversing the queue's state machine:
//!
//! ```text
//! pending ──► processing ──► completed
//!    ▲             │
//!    │             ├─► pending   (retry with backoff, lock expiry)
//!    └─────────────┘
//!                  └─► failed ──► dead letter
//! ```
//!
//! Storage implementations are the sole writers of task fields; workers
//! and schedulers only observe tasks and call the storage contract.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue used when none is specified.
pub const DEFAULT_QUEUE: &str = "default";

/// Priority assigned when none is specified.
pub const DEFAULT_PRIORITY: i16 = 50;

/// Highest accepted priority.
pub const MAX_PRIORITY: i16 = 100;

/// Retry budget assigned when none is specified.
pub const DEFAULT_MAX_RETRIES: i32 = 3;

/// Largest accepted retry budget.
pub const MAX_RETRIES_LIMIT: i32 = 10;

/// Base delay between retry attempts; attempt `n` waits `n * 30s`.
const RETRY_BACKOFF_STEP_SECS: i64 = 30;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Submitted once by an enqueuer with a serialized payload.
    #[default]
    OneTime,
    /// Materialized by the scheduler from a registered schedule;
    /// carries no payload.
    Periodic,
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskType::OneTime => write!(f, "one_time"),
            TaskType::Periodic => write!(f, "periodic"),
        }
    }
}

// ============================================================================
// Task
// ============================================================================

/// A durable work record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,

    /// Routing key; workers subscribe to a set of queues.
    pub queue: String,
    pub task_type: TaskType,
    /// Handler lookup key.
    pub task_name: String,
    /// JSON-serialized payload for one-time tasks; `None` for periodic.
    pub payload: Option<Vec<u8>>,

    pub status: TaskStatus,
    /// Higher claimed first; [0, 100].
    pub priority: i16,

    pub retry_count: i32,
    pub max_retries: i32,

    /// Earliest eligibility time.
    pub scheduled_at: DateTime<Utc>,
    /// Exclusive-lock expiry while processing.
    pub locked_until: Option<DateTime<Utc>>,
    /// Owning worker while processing.
    pub locked_by: Option<String>,

    pub processed_at: Option<DateTime<Utc>>,
    /// Last failure message.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Build a one-time task with a serialized payload.
    pub fn one_time(
        queue: impl Into<String>,
        task_name: impl Into<String>,
        payload: Vec<u8>,
        priority: i16,
        max_retries: i32,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            task_type: TaskType::OneTime,
            task_name: task_name.into(),
            payload: Some(payload),
            status: TaskStatus::Pending,
            priority,
            retry_count: 0,
            max_retries,
            scheduled_at,
            locked_until: None,
            locked_by: None,
            processed_at: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Build a periodic task instance with no payload.
    pub fn periodic(
        queue: impl Into<String>,
        task_name: impl Into<String>,
        priority: i16,
        max_retries: i32,
        scheduled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            task_type: TaskType::Periodic,
            task_name: task_name.into(),
            payload: None,
            status: TaskStatus::Pending,
            priority: priority.clamp(0, MAX_PRIORITY),
            retry_count: 0,
            max_retries,
            scheduled_at,
            locked_until: None,
            locked_by: None,
            processed_at: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the lock held on this task has expired at `now`.
    pub fn lock_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.locked_until, Some(until) if until < now)
    }

    /// Whether a worker subscribed to this task's queue may claim it
    /// at `now`: pending, due, and not under an unexpired lock.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending
            && self.scheduled_at <= now
            && self.locked_until.map_or(true, |until| until < now)
    }

    /// Whether the next failure exhausts the retry budget.
    pub fn retries_exhausted_on_next_failure(&self) -> bool {
        self.retry_count + 1 >= self.max_retries
    }
}

/// Linear backoff: attempt `n` is rescheduled `n * 30s` into the
/// future. Faster than exponential for transient faults without a
/// thundering herd.
pub fn retry_backoff(retry_count: i32) -> Duration {
    Duration::seconds(i64::from(retry_count.max(0)) * RETRY_BACKOFF_STEP_SECS)
}

// ============================================================================
// Dead letter
// ============================================================================

/// Snapshot of a task at retirement into the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadTask {
    pub id: Uuid,
    /// Id of the original task row.
    pub task_id: Uuid,
    pub queue: String,
    pub task_type: TaskType,
    pub task_name: String,
    pub payload: Option<Vec<u8>>,
    pub priority: i16,
    /// Final failure message, copied from the task unconditionally.
    pub error: Option<String>,
    pub retry_count: i32,
    pub failed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl DeadTask {
    /// Snapshot `task` for the dead-letter queue.
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task.id,
            queue: task.queue.clone(),
            task_type: task.task_type,
            task_name: task.task_name.clone(),
            payload: task.payload.clone(),
            priority: task.priority,
            error: task.error.clone(),
            retry_count: task.retry_count,
            failed_at: Utc::now(),
            created_at: task.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending_task() -> Task {
        Task::one_time(
            DEFAULT_QUEUE,
            "test_task",
            b"{}".to_vec(),
            DEFAULT_PRIORITY,
            DEFAULT_MAX_RETRIES,
            Utc::now(),
        )
    }

    #[test]
    fn one_time_task_starts_pending() {
        let task = pending_task();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.task_type, TaskType::OneTime);
        assert_eq!(task.retry_count, 0);
        assert!(task.locked_until.is_none());
        assert!(task.locked_by.is_none());
    }

    #[test]
    fn periodic_task_has_no_payload() {
        let task = Task::periodic(DEFAULT_QUEUE, "cleanup", 90, 0, Utc::now());
        assert_eq!(task.task_type, TaskType::Periodic);
        assert!(task.payload.is_none());
    }

    #[test]
    fn future_task_is_not_claimable() {
        let mut task = pending_task();
        task.scheduled_at = Utc::now() + Duration::minutes(5);
        assert!(!task.is_claimable(Utc::now()));
    }

    #[test]
    fn unexpired_lock_blocks_claim() {
        let now = Utc::now();
        let mut task = pending_task();
        task.locked_until = Some(now + Duration::minutes(1));
        assert!(!task.is_claimable(now));

        task.locked_until = Some(now - Duration::seconds(1));
        assert!(task.is_claimable(now));
    }

    #[test]
    fn backoff_is_linear() {
        assert_eq!(retry_backoff(1), Duration::seconds(30));
        assert_eq!(retry_backoff(2), Duration::seconds(60));
        assert_eq!(retry_backoff(3), Duration::seconds(90));
        assert_eq!(retry_backoff(-1), Duration::zero());
    }

    #[test]
    fn dead_task_copies_last_error() {
        let mut task = pending_task();
        task.error = Some("boom".into());
        task.retry_count = 3;

        let dead = DeadTask::from_task(&task);
        assert_eq!(dead.task_id, task.id);
        assert_eq!(dead.error.as_deref(), Some("boom"));
        assert_eq!(dead.retry_count, 3);
        assert_eq!(dead.created_at, task.created_at);
    }

    #[test]
    fn status_display_is_snake_case() {
        assert_eq!(TaskStatus::Processing.to_string(), "processing");
        assert_eq!(TaskType::OneTime.to_string(), "one_time");
    }
}
