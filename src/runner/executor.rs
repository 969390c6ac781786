//! Execution of a single task attempt.
//!
//! An attempt runs in its own tokio task and talks to the dispatch loop only
//! through two channels: zero or more progress snapshots, then exactly one
//! [`Finished`] message. It never touches the task store.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;

use crate::handler::{HandlerError, Progress};
use crate::spec::TaskSpec;
use crate::task::Task;

/// Outcome of one attempt, sent back to the dispatch loop.
#[derive(Debug)]
pub(crate) struct Finished {
    /// Snapshot of the task at the end of the attempt, carrying its progress and log.
    pub task: Task,
    pub outcome: Result<serde_json::Value, HandlerError>,
}

/// Spawn one attempt of `task` using the handler of `spec`.
pub(crate) fn spawn_attempt(
    spec: Arc<TaskSpec>,
    task: Task,
    timeout: Option<Duration>,
    progress_tx: mpsc::UnboundedSender<Task>,
    finished_tx: mpsc::UnboundedSender<Finished>,
) {
    tokio::spawn(async move {
        let finished = run_attempt(&spec, task, timeout, progress_tx).await;
        // The loop keeps the receiver alive until every active attempt has reported.
        let _ = finished_tx.send(finished);
    });
}

/// Run the handler to completion, converting panics and timeouts into
/// retryable handler errors.
pub(crate) async fn run_attempt(
    spec: &TaskSpec,
    task: Task,
    timeout: Option<Duration>,
    progress_tx: mpsc::UnboundedSender<Task>,
) -> Finished {
    let progress = Progress::new(task.clone(), progress_tx);
    let attempt = AssertUnwindSafe(spec.handler().run(&task, &progress)).catch_unwind();

    let caught = match timeout.filter(|d| *d > Duration::ZERO) {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(caught) => caught,
            Err(_elapsed) => Ok(Err(HandlerError::TimedOut(limit))),
        },
        None => attempt.await,
    };

    let outcome = caught.unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(&*panic))));

    Finished {
        task: progress.snapshot(),
        outcome,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
