//! The dispatch loop.
//!
//! A single tokio task owns all scheduler state: the set of active task ids,
//! the time of the last poll and the shutdown state. Execution routines and
//! the [`RunnerHandle`](super::RunnerHandle) reach it only through channels,
//! so none of this state needs a lock.
//!
//! ```text
//! poll store ──► mark_started ──► spawn_attempt ─┬─► progress ──► update_progress (detached)
//!     ▲                                          └─► finished ──► apply_outcome ──► update
//!     └───────────── every poll_interval, while active < concurrency_limit
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::executor::{self, Finished};
use super::store::{TaskError, TaskStore};
use crate::config::RunnerConfig;
use crate::spec::TaskRegistry;
use crate::task::{Task, TaskId};

/// Request to stop the loop. The sender is signalled once all attempts have drained.
pub(crate) type ShutdownRequest = oneshot::Sender<()>;

enum State {
    Running,
    /// Draining active attempts. The sender is `None` if the handle was dropped.
    Draining(Option<ShutdownRequest>),
}

pub(crate) struct DispatchLoop<S: TaskStore> {
    store: Arc<S>,
    registry: Arc<TaskRegistry>,
    names: Vec<String>,
    config: RunnerConfig,
    active: HashSet<TaskId>,
    last_poll: Option<Instant>,
    state: State,
    progress_tx: mpsc::UnboundedSender<Task>,
    progress_rx: mpsc::UnboundedReceiver<Task>,
    finished_tx: mpsc::UnboundedSender<Finished>,
    finished_rx: mpsc::UnboundedReceiver<Finished>,
    shutdown_rx: mpsc::Receiver<ShutdownRequest>,
}

impl<S: TaskStore + 'static> DispatchLoop<S> {
    pub(crate) fn new(
        store: Arc<S>,
        registry: Arc<TaskRegistry>,
        config: RunnerConfig,
        shutdown_rx: mpsc::Receiver<ShutdownRequest>,
    ) -> Self {
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let names = registry.names();

        Self {
            store,
            registry,
            names,
            config,
            active: HashSet::new(),
            last_poll: None,
            state: State::Running,
            progress_tx,
            progress_rx,
            finished_tx,
            finished_rx,
            shutdown_rx,
        }
    }

    /// Run until a shutdown has been requested and every active attempt has finished.
    pub(crate) async fn run(mut self) {
        info!(
            concurrency_limit = self.config.concurrency_limit,
            poll_interval_ms =
                u64::try_from(self.config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            task_types = self.names.len(),
            "Launching task runner"
        );

        loop {
            if self.accepting_work() && self.poll_due() && self.has_capacity() {
                self.start_new_tasks().await;
                self.last_poll = Some(Instant::now());
            }

            let accepting = self.accepting_work();
            tokio::select! {
                Some(task) = self.progress_rx.recv() => self.persist_progress(task),
                Some(finished) = self.finished_rx.recv() => self.finish_task(finished).await,
                request = self.shutdown_rx.recv(), if accepting => self.begin_shutdown(request),
                _ = tokio::time::sleep(self.config.idle_wait) => {}
            }

            if let State::Draining(request) = &mut self.state {
                if self.active.is_empty() {
                    if let Some(done) = request.take() {
                        let _ = done.send(());
                    }
                    info!("Task runner shutdown complete");
                    return;
                }
            }
        }
    }

    fn accepting_work(&self) -> bool {
        matches!(self.state, State::Running)
    }

    fn has_capacity(&self) -> bool {
        self.active.len() < self.config.concurrency_limit
    }

    fn poll_due(&self) -> bool {
        self.last_poll
            .map_or(true, |last| last.elapsed() >= self.config.poll_interval)
    }

    async fn start_new_tasks(&mut self) {
        let limit = self.config.concurrency_limit - self.active.len();
        let tasks = match self.store.find_eligible(&self.names, limit, Utc::now()).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "Could not fetch new tasks");
                return;
            }
        };

        for task in tasks {
            let id = task.id;
            if let Err(e) = self.start_task(task).await {
                error!(task_id = %id, error = %e, "Could not start task");
            }
        }
    }

    async fn start_task(&mut self, mut task: Task) -> Result<(), TaskError> {
        if self.active.contains(&task.id) || !self.has_capacity() {
            return Ok(());
        }

        let spec = self
            .registry
            .get(&task.name)
            .cloned()
            .ok_or_else(|| TaskError::UnknownTask(task.name.clone()))?;

        task.mark_started(Utc::now());
        if !self.store.mark_started(&task).await? {
            debug!(task_id = %task.id, task = %task.name, "Task no longer eligible, skipping");
            return Ok(());
        }

        self.active.insert(task.id);
        debug!(
            task_id = %task.id,
            task = %task.name,
            attempt = task.try_count + 1,
            active = self.active.len(),
            "Running task"
        );

        executor::spawn_attempt(
            spec,
            task,
            self.config.attempt_timeout,
            self.progress_tx.clone(),
            self.finished_tx.clone(),
        );
        Ok(())
    }

    /// Persist a progress snapshot without blocking the loop. Failures are logged and dropped.
    fn persist_progress(&self, task: Task) {
        if !self.active.contains(&task.id) {
            return;
        }
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(e) = store.update_progress(&task).await {
                error!(task_id = %task.id, error = %e, "Could not persist task progress");
            }
        });
    }

    async fn finish_task(&mut self, finished: Finished) {
        let Finished { mut task, outcome } = finished;

        let spec = self.registry.get(&task.name).cloned();
        let policy = spec
            .as_ref()
            .map(|s| s.retry_policy().clone())
            .unwrap_or_default();
        task.apply_outcome(outcome, &policy, Utc::now());

        if task.complete && task.success {
            debug!(
                task_id = %task.id,
                task = %task.name,
                elapsed_ms = task.attempt_duration().map_or(0, |d| d.num_milliseconds()),
                "Task completed successfully"
            );
        } else if task.complete {
            warn!(
                task_id = %task.id,
                task = %task.name,
                tries = task.try_count,
                error = task.error.as_deref().unwrap_or_default(),
                "Task failed"
            );
        } else {
            warn!(
                task_id = %task.id,
                task = %task.name,
                tries = task.try_count,
                run_at = ?task.run_at,
                error = task.error.as_deref().unwrap_or_default(),
                "Task failed, will retry"
            );
        }

        if let Err(e) = self.store.update(&task).await {
            error!(task_id = %task.id, error = %e, "Could not update task");
        }

        self.active.remove(&task.id);
        if matches!(self.state, State::Draining(_)) {
            info!(
                remaining = self.active.len(),
                "Shutting down - waiting for remaining tasks to finish"
            );
        }

        // Runs after every finished attempt; the hook inspects `complete` itself.
        if let Some(hook) = spec.as_ref().and_then(|s| s.completion_hook()).cloned() {
            tokio::spawn(async move {
                hook.on_complete(&task).await;
            });
        }
    }

    fn begin_shutdown(&mut self, request: Option<ShutdownRequest>) {
        if request.is_none() {
            debug!("Runner handle dropped, draining");
        }
        info!(
            active = self.active.len(),
            "Shutting down - waiting for remaining tasks to finish"
        );
        self.state = State::Draining(request);
    }
}
