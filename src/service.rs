//! Caller-facing facade for queueing and inspecting tasks.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::runner::{TaskError, TaskStore};
use crate::spec::TaskRegistry;
use crate::task::{NewTask, Task, TaskId};

/// Queue tasks and read their state.
///
/// Failures of a queued task never surface here; callers observe them by
/// reading the task back and inspecting `complete`, `success` and `error`.
pub struct TaskService<S: TaskStore> {
    store: Arc<S>,
    registry: Option<Arc<TaskRegistry>>,
}

impl<S: TaskStore> Clone for TaskService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<S: TaskStore> TaskService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            registry: None,
        }
    }

    /// Reject tasks whose name is not registered in `registry`.
    pub fn with_registry(mut self, registry: Arc<TaskRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Persist a new task and return its id.
    pub async fn queue(&self, new: NewTask) -> Result<TaskId, TaskError> {
        if new.name.is_empty() {
            return Err(TaskError::EmptyName);
        }
        if let Some(registry) = &self.registry {
            if !registry.contains(&new.name) {
                return Err(TaskError::UnknownTask(new.name));
            }
        }

        let name = new.name.clone();
        let id = self.store.create(Task::from_new(new, Utc::now())).await?;
        debug!(task_id = %id, task = %name, "Queued task");
        Ok(id)
    }

    /// Queue a task with a serialized payload.
    pub async fn queue_data<T: Serialize>(&self, name: &str, data: &T) -> Result<TaskId, TaskError> {
        self.queue(NewTask::with_data(name, data)?).await
    }

    /// Read a task. Returns `Ok(None)` if no task has this id.
    pub async fn get_task(&self, id: TaskId) -> Result<Option<Task>, TaskError> {
        self.store.find_one(id).await
    }

    /// Cancel a task that is neither running nor complete.
    ///
    /// A running attempt is never interrupted; cancellation only prevents
    /// future dispatch.
    pub async fn cancel_task(&self, id: TaskId) -> Result<Task, TaskError> {
        let task = self.store.cancel(id).await?;
        debug!(task_id = %id, task = %task.name, "Cancelled task");
        Ok(task)
    }

    /// Return a task that completed unsuccessfully to the eligible pool.
    pub async fn retry_task(&self, id: TaskId) -> Result<Task, TaskError> {
        let mut task = self
            .store
            .find_one(id)
            .await?
            .ok_or(TaskError::NotFound(id))?;
        task.requeue()?;
        self.store.update(&task).await?;
        debug!(task_id = %id, task = %task.name, tries = task.try_count, "Requeued task");
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{handler_fn, HandlerError, Progress};
    use crate::runner::MemoryTaskStore;
    use crate::spec::TaskSpec;
    use serde_json::json;

    fn service() -> TaskService<MemoryTaskStore> {
        TaskService::new(Arc::new(MemoryTaskStore::new()))
    }

    #[tokio::test]
    async fn test_queue_and_get() {
        let service = service();
        let id = service.queue(NewTask::new("double", json!(22))).await.unwrap();

        let task = service.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.name, "double");
        assert_eq!(task.data, json!(22));
        assert!(!task.complete);
        assert!(!task.running);
        assert_eq!(task.try_count, 0);
    }

    #[tokio::test]
    async fn test_queue_rejects_empty_name() {
        let err = service()
            .queue(NewTask::new("", json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::EmptyName));
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_queue_rejects_unregistered_name_with_registry() {
        let mut registry = TaskRegistry::new();
        registry.register(TaskSpec::new(
            "known",
            handler_fn(|_task: Task, _progress: Progress| async {
                Ok::<_, HandlerError>(json!(null))
            }),
        ));
        let service = service().with_registry(Arc::new(registry));

        assert!(service.queue(NewTask::new("known", json!(1))).await.is_ok());
        assert!(matches!(
            service.queue(NewTask::new("unknown", json!(1))).await,
            Err(TaskError::UnknownTask(name)) if name == "unknown"
        ));
    }

    #[tokio::test]
    async fn test_get_missing_task_is_none() {
        assert!(service().get_task(TaskId(7)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_task_is_idempotent() {
        let service = service();
        let id = service.queue_data("double", &22).await.unwrap();
        let first = service.get_task(id).await.unwrap();
        let second = service.get_task(id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_cancel_task() {
        let service = service();
        let id = service.queue(NewTask::new("double", json!(1))).await.unwrap();

        let task = service.cancel_task(id).await.unwrap();
        assert!(task.cancelled);
        assert!(service.get_task(id).await.unwrap().unwrap().cancelled);
        assert!(matches!(
            service.cancel_task(TaskId(99)).await,
            Err(TaskError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_task_requires_failed_completion() {
        let service = service();
        let id = service.queue(NewTask::new("double", json!(1))).await.unwrap();

        assert!(matches!(
            service.retry_task(id).await,
            Err(TaskError::InvalidState { .. })
        ));

        let mut task = service.get_task(id).await.unwrap().unwrap();
        task.complete = true;
        task.try_count = 3;
        task.error = Some("permanent: boom".into());
        service.store.update(&task).await.unwrap();

        let requeued = service.retry_task(id).await.unwrap();
        assert!(!requeued.complete);
        assert_eq!(requeued.try_count, 3);
        assert!(requeued.is_eligible(Utc::now()));
    }
}
