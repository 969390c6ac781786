//! Task handler trait, handler errors and the progress sink.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::task::Task;

/// Error returned by a task handler.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Transient failure - worth retrying.
    #[error("retryable: {0}")]
    Retryable(#[source] anyhow::Error),

    /// Permanent failure - won't succeed on retry.
    #[error("permanent: {0}")]
    Permanent(#[source] anyhow::Error),

    /// The handler panicked during the attempt.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The attempt ran past the configured timeout.
    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),
}

impl HandlerError {
    /// Create a retryable error.
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(err.into())
    }

    /// Create a permanent error.
    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }

    /// Returns true if another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

/// Executes tasks of one type.
///
/// The handler receives a snapshot of the task taken when the attempt started
/// and a [`Progress`] sink. It must not write to the task store itself.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: &Task, progress: &Progress)
        -> Result<serde_json::Value, HandlerError>;
}

/// Handler backed by an async closure. See [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`TaskHandler`].
///
/// ```rust,ignore
/// let handler = handler_fn(|task: Task, _progress: Progress| async move {
///     let n: i64 = serde_json::from_value(task.data).map_err(HandlerError::permanent)?;
///     Ok::<_, HandlerError>(serde_json::json!(n * 2))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Task, Progress) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Task, Progress) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    async fn run(
        &self,
        task: &Task,
        progress: &Progress,
    ) -> Result<serde_json::Value, HandlerError> {
        (self.f)(task.clone(), progress.clone()).await
    }
}

/// Sink through which a running handler reports progress and log output.
///
/// Every [`report`](Progress::report) sends a snapshot to the dispatch loop,
/// which persists it on a best-effort basis. Log lines are kept with the
/// attempt and stored together with its outcome.
#[derive(Clone)]
pub struct Progress {
    inner: Arc<ProgressInner>,
}

struct ProgressInner {
    snapshot: Mutex<Task>,
    tx: mpsc::UnboundedSender<Task>,
}

impl Progress {
    pub(crate) fn new(snapshot: Task, tx: mpsc::UnboundedSender<Task>) -> Self {
        Self {
            inner: Arc::new(ProgressInner {
                snapshot: Mutex::new(snapshot),
                tx,
            }),
        }
    }

    /// Update the task's progress value and publish a snapshot.
    pub fn report(&self, progress: i32) {
        let snapshot = {
            let mut task = self.lock();
            task.progress = progress;
            task.clone()
        };
        // The receiver only goes away once the dispatch loop has exited.
        let _ = self.inner.tx.send(snapshot);
    }

    /// Append a line to the attempt's log.
    pub fn log(&self, line: impl AsRef<str>) {
        let mut task = self.lock();
        if !task.log.is_empty() {
            task.log.push('\n');
        }
        task.log.push_str(line.as_ref());
    }

    /// The latest progress value reported during this attempt.
    pub fn current(&self) -> i32 {
        self.lock().progress
    }

    pub(crate) fn snapshot(&self) -> Task {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Task> {
        self.inner
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
