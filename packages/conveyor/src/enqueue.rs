//! Enqueuer for submitting one-time tasks.
//!
//! The enqueuer serializes a typed payload to JSON bytes, applies
//! option defaults, and inserts a pending task through the storage
//! contract. Periodic tasks never pass through here; the scheduler
//! materializes those directly.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::QueueError;
use crate::handler::task_name_for;
use crate::storage::Storage;
use crate::task::{
    Task, DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY, DEFAULT_QUEUE, MAX_PRIORITY, MAX_RETRIES_LIMIT,
};

/// Options for a single enqueue call. Unset fields fall back to the
/// enqueuer's defaults; zero or invalid values are treated as unset.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub queue: Option<String>,
    pub priority: Option<i16>,
    pub max_retries: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub delay: Option<Duration>,
    pub task_name: Option<String>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Target a queue other than the enqueuer's default.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Claim priority in [0, 100]; higher first.
    pub fn with_priority(mut self, priority: i16) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Retry budget; values above 10 are capped.
    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Earliest execution time. Wins over `with_delay` when both are set.
    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Earliest execution time relative to now.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Override the handler lookup name derived from the payload type.
    pub fn with_task_name(mut self, name: impl Into<String>) -> Self {
        self.task_name = Some(name.into());
        self
    }
}

/// Submits one-time tasks through a [`Storage`] backend.
#[derive(Clone)]
pub struct Enqueuer {
    storage: Arc<dyn Storage>,
    default_queue: String,
    default_priority: i16,
}

impl Enqueuer {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            default_queue: DEFAULT_QUEUE.to_string(),
            default_priority: DEFAULT_PRIORITY,
        }
    }

    /// Override the queue and priority used when options leave them
    /// unset. Invalid values keep the built-in defaults.
    pub fn with_defaults(mut self, queue: impl Into<String>, priority: i16) -> Self {
        let queue = queue.into();
        if !queue.is_empty() {
            self.default_queue = queue;
        }
        if (0..=MAX_PRIORITY).contains(&priority) {
            self.default_priority = priority;
        }
        self
    }

    /// Serialize `payload` and insert a pending task.
    ///
    /// Returns the new task's id. Fails with [`QueueError::PayloadNil`]
    /// when the payload serializes to null, and with
    /// [`QueueError::InvalidPriority`] when an explicit priority is out
    /// of range.
    pub async fn enqueue<T: Serialize>(
        &self,
        payload: &T,
        options: EnqueueOptions,
    ) -> Result<Uuid, QueueError> {
        let value = serde_json::to_value(payload)?;
        if value.is_null() {
            return Err(QueueError::PayloadNil);
        }

        let priority = options.priority.unwrap_or(self.default_priority);
        if !(0..=MAX_PRIORITY).contains(&priority) {
            return Err(QueueError::InvalidPriority(priority));
        }

        let max_retries = options
            .max_retries
            .unwrap_or(DEFAULT_MAX_RETRIES)
            .clamp(0, MAX_RETRIES_LIMIT);

        let queue = options
            .queue
            .filter(|q| !q.is_empty())
            .unwrap_or_else(|| self.default_queue.clone());

        let task_name = options
            .task_name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| task_name_for::<T>().to_string());

        // An explicit scheduled_at wins over a delay.
        let now = Utc::now();
        let scheduled_at = options
            .scheduled_at
            .or_else(|| {
                options
                    .delay
                    .and_then(|d| chrono::Duration::from_std(d).ok())
                    .map(|d| now + d)
            })
            .unwrap_or(now);

        let bytes = serde_json::to_vec(&value)?;
        let task = Task::one_time(queue, task_name, bytes, priority, max_retries, scheduled_at);
        let task_id = task.id;
        let task_name = task.task_name.clone();
        let queue = task.queue.clone();

        self.storage.create_task(task).await.map_err(|e| {
            QueueError::Storage(format!(
                "failed to enqueue task {task_name} to queue {queue}: {e}"
            ))
        })?;

        debug!(
            task_id = %task_id,
            task_name = %task_name,
            queue = %queue,
            priority,
            "task enqueued"
        );
        Ok(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use crate::task::TaskStatus;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Welcome {
        user: String,
    }

    fn enqueuer() -> (Arc<MemoryStorage>, Enqueuer) {
        let storage = Arc::new(MemoryStorage::new());
        let enqueuer = Enqueuer::new(storage.clone());
        (storage, enqueuer)
    }

    #[tokio::test]
    async fn enqueue_applies_defaults() {
        let (storage, enqueuer) = enqueuer();

        let id = enqueuer
            .enqueue(&Welcome { user: "ada".into() }, EnqueueOptions::new())
            .await
            .unwrap();

        let task = storage.get_task(id).unwrap();
        assert_eq!(task.queue, DEFAULT_QUEUE);
        assert_eq!(task.priority, DEFAULT_PRIORITY);
        assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.task_name, task_name_for::<Welcome>());
        assert!(task.scheduled_at <= Utc::now());
        assert!(task.payload.is_some());
    }

    #[tokio::test]
    async fn enqueue_rejects_null_payload() {
        let (_storage, enqueuer) = enqueuer();

        let err = enqueuer
            .enqueue(&Option::<Welcome>::None, EnqueueOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::PayloadNil);
    }

    #[tokio::test]
    async fn enqueue_rejects_out_of_range_priority() {
        let (_storage, enqueuer) = enqueuer();

        let err = enqueuer
            .enqueue(
                &Welcome { user: "ada".into() },
                EnqueueOptions::new().with_priority(101),
            )
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::InvalidPriority(101));
    }

    #[tokio::test]
    async fn scheduled_at_wins_over_delay() {
        let (storage, enqueuer) = enqueuer();
        let at = Utc::now() + chrono::Duration::hours(2);

        let id = enqueuer
            .enqueue(
                &Welcome { user: "ada".into() },
                EnqueueOptions::new()
                    .with_delay(Duration::from_secs(5))
                    .with_scheduled_at(at),
            )
            .await
            .unwrap();

        assert_eq!(storage.get_task(id).unwrap().scheduled_at, at);
    }

    #[tokio::test]
    async fn delay_offsets_from_now() {
        let (storage, enqueuer) = enqueuer();

        let id = enqueuer
            .enqueue(
                &Welcome { user: "ada".into() },
                EnqueueOptions::new().with_delay(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        let delay = storage.get_task(id).unwrap().scheduled_at - Utc::now();
        assert!(delay > chrono::Duration::seconds(55));
        assert!(delay <= chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn max_retries_is_capped() {
        let (storage, enqueuer) = enqueuer();

        let id = enqueuer
            .enqueue(
                &Welcome { user: "ada".into() },
                EnqueueOptions::new().with_max_retries(50),
            )
            .await
            .unwrap();

        assert_eq!(storage.get_task(id).unwrap().max_retries, MAX_RETRIES_LIMIT);
    }

    #[tokio::test]
    async fn explicit_task_name_overrides_type_name() {
        let (storage, enqueuer) = enqueuer();

        let id = enqueuer
            .enqueue(
                &Welcome { user: "ada".into() },
                EnqueueOptions::new().with_task_name("emails:welcome"),
            )
            .await
            .unwrap();

        assert_eq!(storage.get_task(id).unwrap().task_name, "emails:welcome");
    }
}
