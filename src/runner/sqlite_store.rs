//! SQLite implementation of TaskStore.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::store::{TaskError, TaskStore};
use crate::task::{Task, TaskId};

const MAX_ERROR_LEN: usize = 2000;

const COLUMNS: &str = "id, name, data, result, priority, progress, created_at, run_at, \
     try_count, started_at, finished_at, running, complete, success, cancelled, error, log";

/// SQLite-backed task store.
///
/// Timestamps are stored as unix milliseconds so that `run_at` compares
/// numerically in the eligibility query.
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    /// Create a new SqliteTaskStore.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run migrations to create the tasks table.
    pub async fn run_migrations(&self) -> Result<(), TaskError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS delta_tasks (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                data TEXT NOT NULL,
                result TEXT,
                priority INTEGER NOT NULL DEFAULT 0,
                progress INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                run_at INTEGER,
                try_count INTEGER NOT NULL DEFAULT 0,
                started_at INTEGER,
                finished_at INTEGER,
                running INTEGER NOT NULL DEFAULT 0,
                complete INTEGER NOT NULL DEFAULT 0,
                success INTEGER NOT NULL DEFAULT 0,
                cancelled INTEGER NOT NULL DEFAULT 0,
                error TEXT,
                log TEXT NOT NULL DEFAULT ''
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| TaskError::StorageError(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_delta_tasks_eligible
            ON delta_tasks(complete, running, cancelled, run_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| TaskError::StorageError(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_delta_tasks_name
            ON delta_tasks(name, complete)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| TaskError::StorageError(e.to_string()))?;

        Ok(())
    }
}

fn to_json(value: &serde_json::Value) -> Result<String, TaskError> {
    serde_json::to_string(value).map_err(|e| TaskError::SerializationError(e.to_string()))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, TaskError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| TaskError::DeserializationError(format!("invalid timestamp: {ms}")))
}

fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, TaskError> {
    ms.map(from_millis).transpose()
}

fn truncate_error(error: &str) -> &str {
    if error.len() <= MAX_ERROR_LEN {
        return error;
    }
    let mut end = MAX_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    &error[..end]
}

fn row_to_task(row: &SqliteRow) -> Result<Task, TaskError> {
    let storage = |e: sqlx::Error| TaskError::StorageError(e.to_string());

    let data: String = row.try_get("data").map_err(storage)?;
    let result: Option<String> = row.try_get("result").map_err(storage)?;
    let try_count: i64 = row.try_get("try_count").map_err(storage)?;

    Ok(Task {
        id: TaskId(row.try_get("id").map_err(storage)?),
        name: row.try_get("name").map_err(storage)?,
        data: serde_json::from_str(&data)
            .map_err(|e| TaskError::DeserializationError(e.to_string()))?,
        result: result
            .map(|r| serde_json::from_str(&r))
            .transpose()
            .map_err(|e| TaskError::DeserializationError(e.to_string()))?,
        priority: row.try_get("priority").map_err(storage)?,
        progress: row.try_get("progress").map_err(storage)?,
        created_at: from_millis(row.try_get("created_at").map_err(storage)?)?,
        run_at: opt_from_millis(row.try_get("run_at").map_err(storage)?)?,
        try_count: u32::try_from(try_count)
            .map_err(|e| TaskError::DeserializationError(e.to_string()))?,
        started_at: opt_from_millis(row.try_get("started_at").map_err(storage)?)?,
        finished_at: opt_from_millis(row.try_get("finished_at").map_err(storage)?)?,
        running: row.try_get("running").map_err(storage)?,
        complete: row.try_get("complete").map_err(storage)?,
        success: row.try_get("success").map_err(storage)?,
        cancelled: row.try_get("cancelled").map_err(storage)?,
        error: row.try_get("error").map_err(storage)?,
        log: row.try_get("log").map_err(storage)?,
    })
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, task: Task) -> Result<TaskId, TaskError> {
        let data = to_json(&task.data)?;
        let result = task.result.as_ref().map(to_json).transpose()?;

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO delta_tasks (
                name, data, result, priority, progress, created_at, run_at,
                try_count, started_at, finished_at, running, complete, success,
                cancelled, error, log
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&task.name)
        .bind(data)
        .bind(result)
        .bind(task.priority)
        .bind(task.progress)
        .bind(task.created_at.timestamp_millis())
        .bind(task.run_at.map(|t| t.timestamp_millis()))
        .bind(i64::from(task.try_count))
        .bind(task.started_at.map(|t| t.timestamp_millis()))
        .bind(task.finished_at.map(|t| t.timestamp_millis()))
        .bind(task.running)
        .bind(task.complete)
        .bind(task.success)
        .bind(task.cancelled)
        .bind(task.error.as_deref().map(truncate_error))
        .bind(&task.log)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TaskError::StorageError(e.to_string()))?;

        Ok(TaskId(id))
    }

    async fn update(&self, task: &Task) -> Result<(), TaskError> {
        let result = task.result.as_ref().map(to_json).transpose()?;

        let updated = sqlx::query(
            r#"
            UPDATE delta_tasks
            SET result = ?, priority = ?, progress = ?, run_at = ?, try_count = ?,
                started_at = ?, finished_at = ?, running = ?, complete = ?,
                success = ?, cancelled = ?, error = ?, log = ?
            WHERE id = ?
            "#,
        )
        .bind(result)
        .bind(task.priority)
        .bind(task.progress)
        .bind(task.run_at.map(|t| t.timestamp_millis()))
        .bind(i64::from(task.try_count))
        .bind(task.started_at.map(|t| t.timestamp_millis()))
        .bind(task.finished_at.map(|t| t.timestamp_millis()))
        .bind(task.running)
        .bind(task.complete)
        .bind(task.success)
        .bind(task.cancelled)
        .bind(task.error.as_deref().map(truncate_error))
        .bind(&task.log)
        .bind(task.id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| TaskError::StorageError(e.to_string()))?;

        if updated.rows_affected() == 0 {
            return Err(TaskError::NotFound(task.id));
        }
        Ok(())
    }

    async fn update_progress(&self, task: &Task) -> Result<(), TaskError> {
        sqlx::query(
            r#"
            UPDATE delta_tasks
            SET progress = ?, log = ?
            WHERE id = ? AND running = 1
            "#,
        )
        .bind(task.progress)
        .bind(&task.log)
        .bind(task.id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| TaskError::StorageError(e.to_string()))?;

        Ok(())
    }

    async fn mark_started(&self, task: &Task) -> Result<bool, TaskError> {
        let started_at = task.started_at.unwrap_or_else(Utc::now).timestamp_millis();

        let updated = sqlx::query(
            r#"
            UPDATE delta_tasks
            SET running = 1, started_at = ?, finished_at = NULL, progress = ?,
                error = NULL, log = ?
            WHERE id = ? AND running = 0 AND complete = 0 AND cancelled = 0
              AND (run_at IS NULL OR run_at <= ?)
            "#,
        )
        .bind(started_at)
        .bind(task.progress)
        .bind(&task.log)
        .bind(task.id.0)
        .bind(started_at)
        .execute(&self.pool)
        .await
        .map_err(|e| TaskError::StorageError(e.to_string()))?;

        Ok(updated.rows_affected() == 1)
    }

    async fn cancel(&self, id: TaskId) -> Result<Task, TaskError> {
        let updated = sqlx::query(
            r#"
            UPDATE delta_tasks
            SET cancelled = 1
            WHERE id = ? AND running = 0 AND complete = 0
            "#,
        )
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| TaskError::StorageError(e.to_string()))?;

        let mut task = self.find_one(id).await?.ok_or(TaskError::NotFound(id))?;
        if updated.rows_affected() == 0 {
            // Reuse the record's own transition to report why it was refused.
            task.cancel()?;
        }
        Ok(task)
    }

    async fn find_one(&self, id: TaskId) -> Result<Option<Task>, TaskError> {
        let query = format!("SELECT {COLUMNS} FROM delta_tasks WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| TaskError::StorageError(e.to_string()))?;

        row.as_ref().map(row_to_task).transpose()
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

        // Build placeholders for IN clause
        let placeholders: Vec<&str> = names.iter().map(|_| "?").collect();
        let in_clause = placeholders.join(",");

        let select_query = format!(
            r#"
            SELECT {COLUMNS} FROM delta_tasks
            WHERE complete = 0 AND running = 0 AND cancelled = 0
              AND (run_at IS NULL OR run_at <= ?)
              AND name IN ({in_clause})
            ORDER BY priority DESC, created_at, id
            LIMIT ?
            "#
        );

        let mut query = sqlx::query(&select_query).bind(now.timestamp_millis());
        for name in names {
            query = query.bind(name);
        }
        let rows = query
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| TaskError::StorageError(e.to_string()))?;

        rows.iter().map(row_to_task).collect()
    }
}
