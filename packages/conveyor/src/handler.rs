//! Handler registry for dispatching claimed tasks.
//!
//! The registry maps task names to handlers. Two factory forms cover
//! the common cases:
//! - [`task_handler`] builds a typed handler: the payload is
//!   deserialized from JSON bytes into a value type, and the task name
//!   is derived from that type's qualified name. The enqueuer derives
//!   names the same way, so typed enqueue and typed handling line up
//!   without string constants.
//! - [`periodic_handler`] builds a payload-less handler under an
//!   explicit name, matching tasks the scheduler materializes.
//!
//! Handlers return `anyhow::Result` so user code composes freely; the
//! worker converts failures into task failure messages and they never
//! escape it.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::QueueError;
use crate::storage::Storage;
use crate::task::Task;

/// Per-invocation context handed to a handler.
///
/// Carries the claimed task's identity and a handle back to storage so
/// long-running handlers can extend their lock. The context's deadline
/// token fires when the lock budget is spent; cooperative handlers may
/// observe it, and the worker enforces it regardless.
#[derive(Clone)]
pub struct TaskContext {
    task_id: Uuid,
    task_name: String,
    queue: String,
    retry_count: i32,
    deadline: CancellationToken,
    storage: Arc<dyn Storage>,
}

impl TaskContext {
    pub(crate) fn new(task: &Task, storage: Arc<dyn Storage>, deadline: CancellationToken) -> Self {
        Self {
            task_id: task.id,
            task_name: task.task_name.clone(),
            queue: task.queue.clone(),
            retry_count: task.retry_count,
            deadline,
            storage,
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// How many times this task has already failed.
    pub fn retry_count(&self) -> i32 {
        self.retry_count
    }

    /// Push the task's lock expiry forward for legitimately long work.
    pub async fn extend_lock(&self, duration: Duration) -> Result<(), QueueError> {
        self.storage.extend_lock(self.task_id, duration).await
    }

    /// Completes when the handler's execution deadline is reached.
    pub async fn cancelled(&self) {
        self.deadline.cancelled().await;
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("task_name", &self.task_name)
            .field("queue", &self.queue)
            .field("retry_count", &self.retry_count)
            .finish()
    }
}

/// A registered capability for executing tasks of one name.
#[async_trait]
pub trait Handler: Send + Sync {
    /// The task name this handler serves; the registry key.
    fn name(&self) -> &str;

    /// Execute one claimed task.
    async fn handle(&self, ctx: TaskContext, payload: Option<Vec<u8>>) -> anyhow::Result<()>;
}

/// The task name a typed payload enqueues and handles under.
pub fn task_name_for<T>() -> &'static str {
    std::any::type_name::<T>()
}

struct TypedHandler<T, F> {
    name: String,
    handler: F,
    _payload: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> Handler for TypedHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(TaskContext, T) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: TaskContext, payload: Option<Vec<u8>>) -> anyhow::Result<()> {
        let bytes = payload
            .ok_or_else(|| anyhow::anyhow!("task {} has no payload", self.name))?;
        let value: T = serde_json::from_slice(&bytes)
            .map_err(|e| anyhow::anyhow!("failed to deserialize {}: {}", self.name, e))?;
        (self.handler)(ctx, value).await
    }
}

/// Build a typed handler from an async function over a payload type.
///
/// The task name is the payload type's qualified name, matching what
/// the enqueuer derives when no explicit name is given.
///
/// # Example
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail { to: String }
///
/// let handler = task_handler(|_ctx, email: SendEmail| async move {
///     mailer.send(&email.to).await
/// });
/// registry.register(handler);
/// ```
pub fn task_handler<T, F, Fut>(handler: F) -> Arc<dyn Handler>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(TaskContext, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(TypedHandler {
        name: task_name_for::<T>().to_string(),
        handler,
        _payload: PhantomData,
    })
}

struct PeriodicHandler<F> {
    name: String,
    handler: F,
}

#[async_trait]
impl<F, Fut> Handler for PeriodicHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: TaskContext, _payload: Option<Vec<u8>>) -> anyhow::Result<()> {
        (self.handler)(ctx).await
    }
}

/// Build a payload-less handler under an explicit name for tasks the
/// scheduler materializes.
pub fn periodic_handler<F, Fut>(name: impl Into<String>, handler: F) -> Arc<dyn Handler>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(PeriodicHandler {
        name: name.into(),
        handler,
    })
}

/// Thread-safe mapping from task name to handler.
///
/// Registration is expected only while the service is configuring; the
/// worker reads concurrently afterwards. Registering the same name
/// twice replaces the earlier handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn Handler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: Arc<dyn Handler>) {
        let name = handler.name().to_string();
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// All registered task names.
    pub fn registered_names(&self) -> Vec<String> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use crate::task::{DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY, DEFAULT_QUEUE};
    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct TestPayload {
        value: i32,
    }

    fn ctx(storage: Arc<dyn Storage>) -> TaskContext {
        let task = Task::one_time(
            DEFAULT_QUEUE,
            "test",
            b"{}".to_vec(),
            DEFAULT_PRIORITY,
            DEFAULT_MAX_RETRIES,
            Utc::now(),
        );
        TaskContext::new(&task, storage, CancellationToken::new())
    }

    #[tokio::test]
    async fn typed_handler_deserializes_payload() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let handler = task_handler(|_ctx, payload: TestPayload| async move {
            assert_eq!(payload.value, 42);
            Ok(())
        });

        assert_eq!(handler.name(), task_name_for::<TestPayload>());

        let payload = serde_json::to_vec(&TestPayload { value: 42 }).unwrap();
        handler.handle(ctx(storage), Some(payload)).await.unwrap();
    }

    #[tokio::test]
    async fn typed_handler_rejects_missing_payload() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let handler = task_handler(|_ctx, _payload: TestPayload| async move { Ok(()) });

        let err = handler.handle(ctx(storage), None).await.unwrap_err();
        assert!(err.to_string().contains("no payload"));
    }

    #[tokio::test]
    async fn typed_handler_rejects_bad_json() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let handler = task_handler(|_ctx, _payload: TestPayload| async move { Ok(()) });

        let err = handler
            .handle(ctx(storage), Some(b"not json".to_vec()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("deserialize"));
    }

    #[tokio::test]
    async fn periodic_handler_ignores_payload() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let handler = periodic_handler("cleanup", |_ctx| async move { Ok(()) });

        assert_eq!(handler.name(), "cleanup");
        handler.handle(ctx(storage), None).await.unwrap();
    }

    #[test]
    fn registry_lookup() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        registry.register(periodic_handler("cleanup", |_ctx| async move { Ok(()) }));

        assert!(registry.is_registered("cleanup"));
        assert!(!registry.is_registered("unknown"));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("cleanup").is_some());
        assert_eq!(registry.registered_names(), vec!["cleanup".to_string()]);
    }
}
