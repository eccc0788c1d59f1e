//! Structured error types for the task queue.
//!
//! `QueueError` provides pattern-matchable sentinels instead of generic
//! string errors. Components compare errors by variant identity, so the
//! taxonomy is stable: adding context to a message never changes which
//! variant a caller matches on.
//!
//! # The Error Boundary Rule
//!
//! > Handler errors never escape the worker.
//!
//! - Handlers return `anyhow::Error` (ergonomic for user code)
//! - The worker records the message on the task and moves on
//! - Everything the crate itself returns is a `QueueError`

use thiserror::Error;
use uuid::Uuid;

use crate::task::TaskStatus;

/// Pattern-matchable error type for all queue operations.
#[derive(Debug, Error, PartialEq)]
pub enum QueueError {
    /// A component was constructed without a storage backend.
    #[error("repository is nil")]
    RepositoryNil,

    /// The enqueued payload serialized to null.
    #[error("payload is nil")]
    PayloadNil,

    /// Priority outside the accepted [0, 100] range.
    #[error("invalid priority {0}: must be between 0 and 100")]
    InvalidPriority(i16),

    /// `Run` required handlers but none were registered.
    #[error("no handlers registered")]
    NoHandlers,

    /// No handler is registered for the claimed task's name.
    #[error("no handler registered for task type: {0}")]
    HandlerNotFound(String),

    /// No eligible task was available to claim.
    #[error("no task to claim")]
    NoTaskToClaim,

    /// A periodic task with this name is already registered.
    #[error("task already registered: {0}")]
    TaskAlreadyRegistered(String),

    /// The scheduler was built without storage or schedules.
    #[error("scheduler is not configured")]
    SchedulerNotConfigured,

    /// `Run` was called while the service is already running.
    #[error("service is already running")]
    ServiceAlreadyRunning,

    /// A configure-phase operation was attempted after `Run`.
    #[error("service is not in configuring state")]
    ServiceNotConfiguring,

    /// Graceful shutdown did not drain in-flight work in time.
    #[error("shutdown timeout exceeded")]
    ShutdownTimeoutExceeded,

    /// The worker loop is not running.
    #[error("worker is not running")]
    WorkerNotRunning,

    /// Every concurrency slot is occupied.
    #[error("worker is overloaded")]
    WorkerOverloaded,

    /// The scheduler loop is not running.
    #[error("scheduler is not running")]
    SchedulerNotRunning,

    /// `Run` required scheduled tasks but none were registered.
    #[error("no scheduled tasks registered")]
    NoTasksRegistered,

    /// A health probe failed; the cause sentinel is attached so
    /// callers may test either error.
    #[error("healthcheck failed: {cause}")]
    HealthcheckFailed {
        #[source]
        cause: Box<QueueError>,
    },

    /// No task exists with the given id.
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// A task with the given id already exists.
    #[error("duplicate task id: {0}")]
    DuplicateTaskId(Uuid),

    /// A state transition was rejected because the task is not in the
    /// required status.
    #[error("task {task_id} has status {status}, expected {expected}")]
    UnexpectedTaskStatus {
        task_id: Uuid,
        status: TaskStatus,
        expected: TaskStatus,
    },

    /// A lifecycle hook failed.
    #[error("lifecycle hook failed: {0}")]
    Hook(String),

    /// A component task ended abnormally.
    #[error("component failure: {0}")]
    Component(String),

    /// Payload serialization or deserialization failed.
    #[error("payload serialization failed: {0}")]
    Serialization(String),

    /// A storage operation failed; the message carries context about
    /// what was being stored.
    #[error("storage error: {0}")]
    Storage(String),
}

impl QueueError {
    /// Wrap this error as a failed healthcheck.
    pub fn into_healthcheck_failure(self) -> QueueError {
        QueueError::HealthcheckFailed {
            cause: Box::new(self),
        }
    }

    /// The underlying cause of a healthcheck failure, if this is one.
    pub fn healthcheck_cause(&self) -> Option<&QueueError> {
        match self {
            QueueError::HealthcheckFailed { cause } => Some(cause),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_compare_by_variant() {
        assert_eq!(QueueError::NoTaskToClaim, QueueError::NoTaskToClaim);
        assert_ne!(QueueError::NoTaskToClaim, QueueError::WorkerNotRunning);
    }

    #[test]
    fn healthcheck_failure_exposes_cause() {
        let err = QueueError::WorkerOverloaded.into_healthcheck_failure();
        assert_eq!(err.healthcheck_cause(), Some(&QueueError::WorkerOverloaded));
        assert!(err.to_string().contains("healthcheck failed"));
        assert!(err.to_string().contains("overloaded"));
    }

    #[test]
    fn healthcheck_failure_has_source() {
        use std::error::Error;

        let err = QueueError::WorkerNotRunning.into_healthcheck_failure();
        let source = err.source().expect("cause should be attached");
        assert_eq!(source.to_string(), QueueError::WorkerNotRunning.to_string());
    }

    #[test]
    fn handler_not_found_names_the_task() {
        let err = QueueError::HandlerNotFound("emails::Welcome".into());
        assert!(err
            .to_string()
            .contains("no handler registered for task type: emails::Welcome"));
    }
}
