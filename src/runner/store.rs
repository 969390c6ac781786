//! Task storage trait and error types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::task::{Task, TaskId};

/// Error type for task operations.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("storage error: {0}")]
    StorageError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("deserialization error: {0}")]
    DeserializationError(String),

    #[error("task name must not be empty")]
    EmptyName,

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task {id}: {reason}")]
    InvalidState { id: TaskId, reason: &'static str },
}

impl TaskError {
    /// Returns true for errors caused by setup mistakes rather than runtime conditions.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::EmptyName | Self::UnknownTask(_))
    }
}

/// Trait for task storage backends.
///
/// The dispatch loop is the only writer of `running`; stores just persist
/// whatever they are given and answer queries.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task and return its assigned id.
    async fn create(&self, task: Task) -> Result<TaskId, TaskError>;

    /// Overwrite the stored record with `task`.
    async fn update(&self, task: &Task) -> Result<(), TaskError>;

    /// Persist only `progress` and `log`, and only while the stored record is
    /// still running. A late progress write never clobbers a finished attempt.
    async fn update_progress(&self, task: &Task) -> Result<(), TaskError>;

    /// Persist the start of an attempt, but only if the stored record is
    /// still eligible at `task.started_at`. Returns `false` if it is not, for
    /// example because it was cancelled after being polled.
    async fn mark_started(&self, task: &Task) -> Result<bool, TaskError>;

    /// Atomically set `cancelled` on a task that is neither running nor
    /// complete, returning the updated record.
    async fn cancel(&self, id: TaskId) -> Result<Task, TaskError>;

    /// Load a single task. Returns `Ok(None)` if it does not exist.
    async fn find_one(&self, id: TaskId) -> Result<Option<Task>, TaskError>;

    /// Return up to `limit` tasks among `names` that are eligible at `now`,
    /// highest priority first, then oldest first.
    async fn find_eligible(
        &self,
        names: &[String],
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, TaskError>;
}

#[async_trait]
impl<S: TaskStore + ?Sized> TaskStore for std::sync::Arc<S> {
    async fn create(&self, task: Task) -> Result<TaskId, TaskError> {
        (**self).create(task).await
    }

    async fn update(&self, task: &Task) -> Result<(), TaskError> {
        (**self).update(task).await
    }

    async fn update_progress(&self, task: &Task) -> Result<(), TaskError> {
        (**self).update_progress(task).await
    }

    async fn mark_started(&self, task: &Task) -> Result<bool, TaskError> {
        (**self).mark_started(task).await
    }

    async fn cancel(&self, id: TaskId) -> Result<Task, TaskError> {
        (**self).cancel(id).await
    }

    async fn find_one(&self, id: TaskId) -> Result<Option<Task>, TaskError> {
        (**self).find_one(id).await
    }

    async fn find_eligible(
        &self,
        names: &[String],
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, TaskError> {
        (**self).find_eligible(names, limit, now).await
    }
}
