//! In-memory reference storage.
//!
//! A single-writer store protected by a reader-writer lock, with
//! secondary indexes by queue and by status. Every transition of the
//! task state machine happens atomically under the write lock, which
//! makes claims trivially safe against concurrent workers.
//!
//! The store also runs a lock-expiration sweeper: a background task
//! that periodically returns expired `processing` rows to `pending`,
//! recovering work from dead or partitioned workers.
//!
//! This is the storage used by tests and small single-process
//! deployments; SQL-backed implementations follow the same contract
//! with `FOR UPDATE SKIP LOCKED` claims.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::storage::Storage;
use crate::task::{retry_backoff, DeadTask, Task, TaskStatus};

/// How often the sweeper checks for expired locks.
const DEFAULT_LOCK_CHECK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
struct State {
    tasks: HashMap<Uuid, Task>,
    dead_tasks: HashMap<Uuid, DeadTask>,
    by_queue: HashMap<String, HashSet<Uuid>>,
    by_status: HashMap<TaskStatus, HashSet<Uuid>>,
}

impl State {
    fn index(&mut self, task: &Task) {
        self.by_queue
            .entry(task.queue.clone())
            .or_default()
            .insert(task.id);
        self.by_status
            .entry(task.status)
            .or_default()
            .insert(task.id);
    }

    fn reindex_status(&mut self, id: Uuid, from: TaskStatus, to: TaskStatus) {
        if let Some(ids) = self.by_status.get_mut(&from) {
            ids.remove(&id);
        }
        self.by_status.entry(to).or_default().insert(id);
    }

    fn remove(&mut self, id: Uuid) -> Option<Task> {
        let task = self.tasks.remove(&id)?;
        if let Some(ids) = self.by_queue.get_mut(&task.queue) {
            ids.remove(&id);
        }
        if let Some(ids) = self.by_status.get_mut(&task.status) {
            ids.remove(&id);
        }
        Some(task)
    }
}

/// In-memory [`Storage`] implementation with a lock-expiration sweeper.
pub struct MemoryStorage {
    state: Arc<RwLock<State>>,
    sweeper: CancellationToken,
}

impl MemoryStorage {
    /// Create a store and spawn its sweeper with the default 1s check
    /// interval. Must be called from within a tokio runtime.
    pub fn new() -> Self {
        Self::with_lock_check_interval(DEFAULT_LOCK_CHECK_INTERVAL)
    }

    /// Create a store with a custom sweep cadence.
    pub fn with_lock_check_interval(lock_check_interval: Duration) -> Self {
        let state = Arc::new(RwLock::new(State::default()));
        let sweeper = CancellationToken::new();

        tokio::spawn(run_sweeper(
            Arc::clone(&state),
            lock_check_interval,
            sweeper.clone(),
        ));

        Self { state, sweeper }
    }

    /// Stop the background sweeper. Also happens on drop.
    pub fn shutdown(&self) {
        self.sweeper.cancel();
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Inspection helpers (used by tests and callers that audit state)
    // ------------------------------------------------------------------

    /// Fetch a snapshot of a task by id.
    pub fn get_task(&self, task_id: Uuid) -> Option<Task> {
        self.read().tasks.get(&task_id).cloned()
    }

    /// Snapshot of every dead-letter entry.
    pub fn list_dead_tasks(&self) -> Vec<DeadTask> {
        self.read().dead_tasks.values().cloned().collect()
    }

    /// Number of live tasks in the given status.
    pub fn task_count_by_status(&self, status: TaskStatus) -> usize {
        self.read()
            .by_status
            .get(&status)
            .map_or(0, |ids| ids.len())
    }

    /// Total number of live tasks.
    pub fn task_count(&self) -> usize {
        self.read().tasks.len()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

/// Return expired `processing` rows to `pending` every tick.
async fn run_sweeper(
    state: Arc<RwLock<State>>,
    check_interval: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(check_interval);
    interval.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let now = Utc::now();
        let mut guard = state.write().unwrap_or_else(|e| e.into_inner());

        let expired: Vec<Uuid> = guard
            .by_status
            .get(&TaskStatus::Processing)
            .map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|id| {
                        guard
                            .tasks
                            .get(id)
                            .is_some_and(|task| task.lock_expired(now))
                    })
                    .collect()
            })
            .unwrap_or_default();

        for id in expired {
            if let Some(task) = guard.tasks.get_mut(&id) {
                warn!(
                    task_id = %id,
                    task_name = %task.task_name,
                    locked_by = task.locked_by.as_deref().unwrap_or(""),
                    "recovering task with expired lock"
                );
                task.status = TaskStatus::Pending;
                task.locked_until = None;
                task.locked_by = None;
            }
            guard.reindex_status(id, TaskStatus::Processing, TaskStatus::Pending);
        }
    }

    debug!("lock sweeper stopped");
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_task(&self, task: Task) -> Result<(), QueueError> {
        let mut state = self.write();
        if state.tasks.contains_key(&task.id) {
            return Err(QueueError::DuplicateTaskId(task.id));
        }
        state.index(&task);
        state.tasks.insert(task.id, task);
        Ok(())
    }

    async fn claim_task(
        &self,
        worker_id: &str,
        queues: &[String],
        lock_duration: Duration,
    ) -> Result<Task, QueueError> {
        let now = Utc::now();
        let mut state = self.write();

        // Highest priority wins; ties break by earliest scheduled_at.
        let candidate = queues
            .iter()
            .filter_map(|queue| state.by_queue.get(queue))
            .flatten()
            .filter_map(|id| state.tasks.get(id))
            .filter(|task| task.is_claimable(now))
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.scheduled_at.cmp(&a.scheduled_at))
            })
            .map(|task| task.id);

        let Some(id) = candidate else {
            return Err(QueueError::NoTaskToClaim);
        };

        let locked_until = now
            + chrono::Duration::from_std(lock_duration)
                .map_err(|e| QueueError::Storage(format!("lock duration out of range: {e}")))?;

        let Some(task) = state.tasks.get_mut(&id) else {
            return Err(QueueError::TaskNotFound(id));
        };
        task.status = TaskStatus::Processing;
        task.locked_until = Some(locked_until);
        task.locked_by = Some(worker_id.to_string());
        let claimed = task.clone();
        state.reindex_status(id, TaskStatus::Pending, TaskStatus::Processing);

        Ok(claimed)
    }

    async fn complete_task(&self, task_id: Uuid) -> Result<(), QueueError> {
        let mut state = self.write();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(QueueError::TaskNotFound(task_id))?;

        if task.status != TaskStatus::Processing {
            return Err(QueueError::UnexpectedTaskStatus {
                task_id,
                status: task.status,
                expected: TaskStatus::Processing,
            });
        }

        task.status = TaskStatus::Completed;
        task.processed_at = Some(Utc::now());
        task.locked_until = None;
        task.locked_by = None;
        state.reindex_status(task_id, TaskStatus::Processing, TaskStatus::Completed);
        Ok(())
    }

    async fn fail_task(&self, task_id: Uuid, error_msg: &str) -> Result<(), QueueError> {
        let mut state = self.write();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(QueueError::TaskNotFound(task_id))?;

        if task.status != TaskStatus::Processing {
            return Err(QueueError::UnexpectedTaskStatus {
                task_id,
                status: task.status,
                expected: TaskStatus::Processing,
            });
        }

        task.retry_count += 1;
        task.error = Some(error_msg.to_string());
        task.locked_until = None;
        task.locked_by = None;

        let next_status = if task.retry_count >= task.max_retries {
            task.status = TaskStatus::Failed;
            TaskStatus::Failed
        } else {
            // Backoff lives only in scheduled_at: the row is visibly
            // pending again, just not yet eligible for claim.
            task.status = TaskStatus::Pending;
            task.scheduled_at = Utc::now() + retry_backoff(task.retry_count);
            TaskStatus::Pending
        };

        state.reindex_status(task_id, TaskStatus::Processing, next_status);
        Ok(())
    }

    async fn move_to_dlq(&self, task_id: Uuid) -> Result<(), QueueError> {
        let mut state = self.write();
        let task = state
            .remove(task_id)
            .ok_or(QueueError::TaskNotFound(task_id))?;

        // The last error travels with the snapshot unconditionally.
        let dead = DeadTask::from_task(&task);
        state.dead_tasks.insert(dead.id, dead);
        Ok(())
    }

    async fn extend_lock(&self, task_id: Uuid, duration: Duration) -> Result<(), QueueError> {
        let mut state = self.write();
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(QueueError::TaskNotFound(task_id))?;

        if task.status != TaskStatus::Processing {
            return Err(QueueError::UnexpectedTaskStatus {
                task_id,
                status: task.status,
                expected: TaskStatus::Processing,
            });
        }

        let locked_until = Utc::now()
            + chrono::Duration::from_std(duration)
                .map_err(|e| QueueError::Storage(format!("lock duration out of range: {e}")))?;
        task.locked_until = Some(locked_until);
        Ok(())
    }

    async fn get_pending_task_by_name(
        &self,
        task_name: &str,
    ) -> Result<Option<Task>, QueueError> {
        let state = self.read();
        let found = state
            .by_status
            .get(&TaskStatus::Pending)
            .into_iter()
            .flatten()
            .filter_map(|id| state.tasks.get(id))
            .find(|task| task.task_name == task_name)
            .cloned();
        Ok(found)
    }
}
