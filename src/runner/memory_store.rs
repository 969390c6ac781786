//! In-process implementation of TaskStore.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::store::{TaskError, TaskStore};
use crate::task::{Task, TaskId};

/// Task store that keeps every record in memory.
///
/// Useful for tests and for embedding where durability is not needed.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    tasks: BTreeMap<TaskId, Task>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all stored tasks in id order.
    pub async fn all(&self) -> Vec<Task> {
        self.inner.read().await.tasks.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.tasks.is_empty()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn create(&self, mut task: Task) -> Result<TaskId, TaskError> {
        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let id = TaskId(inner.next_id);
        task.id = id;
        inner.tasks.insert(id, task);
        Ok(id)
    }

    async fn update(&self, task: &Task) -> Result<(), TaskError> {
        let mut inner = self.inner.write().await;
        match inner.tasks.get_mut(&task.id) {
            Some(stored) => {
                *stored = task.clone();
                Ok(())
            }
            None => Err(TaskError::NotFound(task.id)),
        }
    }

    async fn update_progress(&self, task: &Task) -> Result<(), TaskError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .tasks
            .get_mut(&task.id)
            .ok_or(TaskError::NotFound(task.id))?;
        if stored.running {
            stored.progress = task.progress;
            stored.log = task.log.clone();
        }
        Ok(())
    }

    async fn mark_started(&self, task: &Task) -> Result<bool, TaskError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .tasks
            .get_mut(&task.id)
            .ok_or(TaskError::NotFound(task.id))?;
        let now = task.started_at.unwrap_or_else(Utc::now);
        if !stored.is_eligible(now) {
            return Ok(false);
        }
        *stored = task.clone();
        Ok(true)
    }

    async fn cancel(&self, id: TaskId) -> Result<Task, TaskError> {
        let mut inner = self.inner.write().await;
        let stored = inner.tasks.get_mut(&id).ok_or(TaskError::NotFound(id))?;
        stored.cancel()?;
        Ok(stored.clone())
    }

    async fn find_one(&self, id: TaskId) -> Result<Option<Task>, TaskError> {
        Ok(self.inner.read().await.tasks.get(&id).cloned())
    }

    async fn find_eligible(
        &self,
        names: &[String],
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, TaskError> {
        if limit == 0 || names.is_empty() {
            return Ok(vec![]);
        }

        let inner = self.inner.read().await;
        let mut eligible: Vec<&Task> = inner
            .tasks
            .values()
            .filter(|t| t.is_eligible(now) && names.iter().any(|n| *n == t.name))
            .collect();

        eligible.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        Ok(eligible.into_iter().take(limit).cloned().collect())
    }
}
