//! Delegation of TASK work to an external executor.
//!
//! The engine only needs two operations from a queue: enqueue a descriptor
//! (returning the task id its result will be delivered under) and abort an
//! outstanding task. Results come back through `OrchestrationEngine::deliver`.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use uuid::Uuid;
use weft_types::task::TaskDescriptor;

#[derive(Debug, thiserror::Error)]
pub enum TaskQueueError {
    #[error("task queue unavailable: {0}")]
    Unavailable(String),

    #[error("task rejected: {0}")]
    Rejected(String),
}

/// Queue an external executor pulls tasks from.
pub trait TaskDispatcher: Send + Sync {
    fn enqueue(
        &self,
        descriptor: TaskDescriptor,
    ) -> impl std::future::Future<Output = Result<String, TaskQueueError>> + Send;

    /// Cancel an outstanding task. `Ok(false)` when the task is unknown or
    /// already finished.
    fn abort(
        &self,
        task_id: &str,
    ) -> impl std::future::Future<Output = Result<bool, TaskQueueError>> + Send;
}

/// Object-safe twin of [`TaskDispatcher`].
pub trait TaskDispatcherDyn: Send + Sync {
    fn enqueue_boxed(&self, descriptor: TaskDescriptor) -> BoxFuture<'_, Result<String, TaskQueueError>>;

    fn abort_boxed<'a>(&'a self, task_id: &'a str) -> BoxFuture<'a, Result<bool, TaskQueueError>>;
}

impl<T: TaskDispatcher> TaskDispatcherDyn for T {
    fn enqueue_boxed(&self, descriptor: TaskDescriptor) -> BoxFuture<'_, Result<String, TaskQueueError>> {
        Box::pin(self.enqueue(descriptor))
    }

    fn abort_boxed<'a>(&'a self, task_id: &'a str) -> BoxFuture<'a, Result<bool, TaskQueueError>> {
        Box::pin(self.abort(task_id))
    }
}

// ---------------------------------------------------------------------------
// InMemoryTaskQueue
// ---------------------------------------------------------------------------

/// Process-local queue. Executors poll with [`InMemoryTaskQueue::take`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskQueue {
    pending: Arc<DashMap<String, TaskDescriptor>>,
    aborted: Arc<DashMap<String, TaskDescriptor>>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return a pending task.
    pub fn take(&self, task_id: &str) -> Option<TaskDescriptor> {
        self.pending.remove(task_id).map(|(_, d)| d)
    }

    /// Ids of tasks waiting to be picked up.
    pub fn pending_ids(&self) -> Vec<String> {
        self.pending.iter().map(|e| e.key().clone()).collect()
    }

    pub fn was_aborted(&self, task_id: &str) -> bool {
        self.aborted.contains_key(task_id)
    }
}

impl TaskDispatcher for InMemoryTaskQueue {
    async fn enqueue(&self, descriptor: TaskDescriptor) -> Result<String, TaskQueueError> {
        let task_id = Uuid::now_v7().to_string();
        tracing::debug!(
            task_id = %task_id,
            category = %descriptor.category,
            node_execution_id = %descriptor.node_execution_id,
            "task enqueued"
        );
        self.pending.insert(task_id.clone(), descriptor);
        Ok(task_id)
    }

    async fn abort(&self, task_id: &str) -> Result<bool, TaskQueueError> {
        match self.pending.remove(task_id) {
            Some((id, descriptor)) => {
                self.aborted.insert(id, descriptor);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn enqueue_then_abort() {
        let queue = InMemoryTaskQueue::new();
        let id = queue
            .enqueue(TaskDescriptor::new("shell", json!({"cmd": "ls"})))
            .await
            .unwrap();
        assert_eq!(queue.pending_ids(), vec![id.clone()]);

        assert!(queue.abort(&id).await.unwrap());
        assert!(queue.was_aborted(&id));
        assert!(!queue.abort(&id).await.unwrap());
    }

    #[tokio::test]
    async fn take_removes_task() {
        let queue = InMemoryTaskQueue::new();
        let id = queue
            .enqueue(TaskDescriptor::new("shell", json!({})))
            .await
            .unwrap();
        assert!(queue.take(&id).is_some());
        assert!(queue.take(&id).is_none());
        assert!(!queue.abort(&id).await.unwrap());
    }

    #[tokio::test]
    async fn usable_as_trait_object() {
        let queue: Arc<dyn TaskDispatcherDyn> = Arc::new(InMemoryTaskQueue::new());
        let id = queue
            .enqueue_boxed(TaskDescriptor::new("shell", json!({})))
            .await
            .unwrap();
        assert!(queue.abort_boxed(&id).await.unwrap());
    }
}
