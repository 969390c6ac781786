//! Task records and their lifecycle transitions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::handler::HandlerError;
use crate::retry::RetryPolicy;
use crate::runner::store::TaskError;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted unit of deferred work and the history of its latest attempt.
///
/// Invariants maintained by the transition methods below:
/// - `running` and `complete` are never both set.
/// - `try_count` never decreases.
/// - `success` is only meaningful once `complete` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Name of the registered [`TaskSpec`](crate::TaskSpec) that handles this task.
    pub name: String,
    pub data: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub priority: i32,
    pub progress: i32,
    pub created_at: DateTime<Utc>,
    /// Earliest time the task may be dispatched. `None` means immediately.
    pub run_at: Option<DateTime<Utc>>,
    pub try_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub running: bool,
    pub complete: bool,
    pub success: bool,
    pub cancelled: bool,
    pub error: Option<String>,
    pub log: String,
}

impl Task {
    /// Build a fresh record from a queue request. The id is assigned by the store.
    pub fn from_new(new: NewTask, created_at: DateTime<Utc>) -> Self {
        Self {
            id: TaskId(0),
            name: new.name,
            data: new.data,
            result: None,
            priority: new.priority,
            progress: 0,
            created_at,
            run_at: new.run_at,
            try_count: 0,
            started_at: None,
            finished_at: None,
            running: false,
            complete: false,
            success: false,
            cancelled: false,
            error: None,
            log: String::new(),
        }
    }

    /// Returns true if the dispatch loop may start an attempt at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        !self.complete
            && !self.running
            && !self.cancelled
            && self.run_at.map_or(true, |run_at| run_at <= now)
    }

    /// Mark the start of a new attempt.
    pub fn mark_started(&mut self, now: DateTime<Utc>) {
        self.running = true;
        self.started_at = Some(now);
        self.finished_at = None;
        self.progress = 0;
        self.error = None;
        self.log.clear();
    }

    /// Record the outcome of the attempt that just finished.
    ///
    /// Successful attempts complete the task. Failed attempts either schedule
    /// the next attempt at `now + delay` or, when the error is permanent or
    /// the retry budget is spent, complete the task unsuccessfully.
    pub fn apply_outcome(
        &mut self,
        outcome: Result<serde_json::Value, HandlerError>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) {
        self.finished_at = Some(now);
        self.try_count += 1;
        self.running = false;

        match outcome {
            Ok(result) => {
                self.complete = true;
                self.success = true;
                self.result = Some(result);
            }
            Err(err) => {
                self.error = Some(err.to_string());
                self.success = false;

                let delay = if err.is_retryable() {
                    policy.retry_delay(self.try_count)
                } else {
                    None
                };

                match delay {
                    Some(delay) => self.run_at = Some(retry_at(now, delay)),
                    None => self.complete = true,
                }
            }
        }
    }

    /// Prevent any future dispatch of this task.
    ///
    /// Only tasks that are neither running nor complete can be cancelled.
    pub fn cancel(&mut self) -> Result<(), TaskError> {
        if self.complete {
            return Err(TaskError::InvalidState {
                id: self.id,
                reason: "task is already complete",
            });
        }
        if self.running {
            return Err(TaskError::InvalidState {
                id: self.id,
                reason: "task is running",
            });
        }
        self.cancelled = true;
        Ok(())
    }

    /// Return a failed task to the eligible pool.
    ///
    /// `try_count` is kept, so a task that exhausted its retries gets exactly
    /// one further attempt.
    pub fn requeue(&mut self) -> Result<(), TaskError> {
        if !self.complete {
            return Err(TaskError::InvalidState {
                id: self.id,
                reason: "task has not completed yet",
            });
        }
        if self.success {
            return Err(TaskError::InvalidState {
                id: self.id,
                reason: "task already succeeded",
            });
        }
        self.complete = false;
        self.cancelled = false;
        self.run_at = None;
        self.error = None;
        Ok(())
    }

    /// Wall-clock duration of the most recent attempt, if it has finished.
    pub fn attempt_duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(started), Some(finished)) => Some(finished - started),
            _ => None,
        }
    }
}

/// `now + delay`, clamped to the latest representable time when the delay
/// does not fit. A clamped task stays pending but is never eligible again.
fn retry_at(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// A request to queue a new task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub name: String,
    pub data: serde_json::Value,
    pub priority: i32,
    pub run_at: Option<DateTime<Utc>>,
}

impl NewTask {
    /// Create a request for the named task type with a JSON payload.
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            data,
            priority: 0,
            run_at: None,
        }
    }

    /// Serialize `data` into the payload.
    pub fn with_data<T: Serialize>(name: impl Into<String>, data: &T) -> Result<Self, TaskError> {
        let data = serde_json::to_value(data)
            .map_err(|e| TaskError::SerializationError(e.to_string()))?;
        Ok(Self::new(name, data))
    }

    /// Set the priority. Higher values are polled first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Delay the first attempt until `run_at`.
    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }
}
