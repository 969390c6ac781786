//! Task runner that polls for tasks and dispatches them to their handlers.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::dispatch::DispatchLoop;
use super::store::{TaskError, TaskStore};
use crate::config::RunnerConfig;
use crate::service::TaskService;
use crate::spec::{TaskRegistry, TaskSpec};
use crate::task::{NewTask, TaskId};

/// Errors from controlling a running [`Runner`].
#[derive(Error, Debug)]
pub enum RunnerError {
    /// The dispatch loop has already stopped.
    #[error("task runner is not running")]
    NotRunning,

    /// The dispatch loop task panicked or was aborted.
    #[error("task runner terminated abnormally: {0}")]
    Join(String),
}

/// A runner that executes tasks from a store.
pub struct Runner<S: TaskStore> {
    store: Arc<S>,
    registry: Arc<TaskRegistry>,
    config: RunnerConfig,
}

impl<S: TaskStore + 'static> Runner<S> {
    /// A service handle sharing this runner's store and registry.
    pub fn service(&self) -> TaskService<S> {
        TaskService::new(self.store.clone()).with_registry(self.registry.clone())
    }

    /// Queue a task for a registered type, serializing `input` as its payload.
    pub async fn submit<T: Serialize>(&self, name: &str, input: T) -> Result<TaskId, TaskError> {
        self.service().queue(NewTask::with_data(name, &input)?).await
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Spawn the dispatch loop onto the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(self) -> RunnerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let dispatch = DispatchLoop::new(self.store, self.registry, self.config, shutdown_rx);
        let join = tokio::spawn(dispatch.run());

        RunnerHandle { shutdown_tx, join }
    }
}

/// Handle to a started runner.
///
/// Dropping the handle without calling [`shutdown`](RunnerHandle::shutdown)
/// also stops the runner once active attempts have finished, but nobody
/// waits for it.
pub struct RunnerHandle {
    shutdown_tx: mpsc::Sender<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl RunnerHandle {
    /// Stop dispatching new attempts and wait until all active attempts have
    /// finished and been persisted. In-flight handlers are not interrupted.
    pub async fn shutdown(self) -> Result<(), RunnerError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.shutdown_tx
            .send(done_tx)
            .await
            .map_err(|_| RunnerError::NotRunning)?;
        done_rx.await.map_err(|_| RunnerError::NotRunning)?;
        self.join.await.map_err(|e| RunnerError::Join(e.to_string()))
    }

    /// Returns true once the dispatch loop has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Builder for constructing a Runner.
pub struct RunnerBuilder<S: TaskStore> {
    store: S,
    registry: TaskRegistry,
    config: RunnerConfig,
}

impl<S: TaskStore + 'static> RunnerBuilder<S> {
    /// Create a new builder with the given store and default configuration.
    pub fn new(store: S) -> Self {
        Self {
            store,
            registry: TaskRegistry::new(),
            config: RunnerConfig::default(),
        }
    }

    /// Register a task type with the runner.
    ///
    /// # Panics
    ///
    /// Panics if the task spec's name is empty.
    pub fn task(mut self, spec: TaskSpec) -> Self {
        self.registry.register(spec);
        self
    }

    /// Replace the registry with a prepared one.
    pub fn registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the maximum number of concurrently running attempts.
    ///
    /// # Panics
    ///
    /// Panics if `n` is 0.
    pub fn concurrency_limit(mut self, n: usize) -> Self {
        assert!(n > 0, "concurrency limit must be at least 1");
        self.config.concurrency_limit = n;
        self
    }

    /// Set the poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the longest single wait of the dispatch loop.
    pub fn idle_wait(mut self, wait: Duration) -> Self {
        self.config.idle_wait = wait;
        self
    }

    /// Limit how long a single attempt may run.
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.config.attempt_timeout = Some(timeout);
        self
    }

    /// Build the runner.
    ///
    /// # Panics
    ///
    /// Panics if the configured concurrency limit is 0.
    pub fn build(self) -> Runner<S> {
        assert!(
            self.config.concurrency_limit > 0,
            "concurrency limit must be at least 1"
        );
        Runner {
            store: Arc::new(self.store),
            registry: Arc::new(self.registry),
            config: self.config,
        }
    }
}
