//! # Deltatask
//!
//! Persistent background tasks that run in your process.
//!
//! Callers queue named tasks with a JSON payload. A runner polls the store,
//! executes eligible tasks through their registered handlers with bounded
//! concurrency, retries failures with backoff and records the outcome on the
//! task record, where callers read it back.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use deltatask::{handler_fn, HandlerError, MemoryTaskStore, Progress, RunnerBuilder, Task, TaskSpec};
//!
//! let runner = RunnerBuilder::new(MemoryTaskStore::new())
//!     .task(
//!         TaskSpec::new("double", handler_fn(|task: Task, progress: Progress| async move {
//!             let n: i64 = serde_json::from_value(task.data).map_err(HandlerError::permanent)?;
//!             progress.report(100);
//!             Ok::<_, HandlerError>(serde_json::json!(n * 2))
//!         }))
//!         .with_retries(3, Duration::from_secs(5)),
//!     )
//!     .concurrency_limit(20)
//!     .build();
//!
//! let service = runner.service();
//! let handle = runner.start();
//!
//! let id = service.queue_data("double", &22).await?;
//! // ... later
//! let task = service.get_task(id).await?;
//!
//! handle.shutdown().await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` - Enable the SQLite-backed task store

pub mod config;
pub mod handler;
pub mod retry;
pub mod runner;
pub mod service;
pub mod spec;
pub mod task;

pub use config::RunnerConfig;
pub use handler::{handler_fn, FnHandler, HandlerError, Progress, TaskHandler};
pub use retry::RetryPolicy;
pub use runner::{
    MemoryTaskStore, Runner, RunnerBuilder, RunnerError, RunnerHandle, TaskError, TaskStore,
};
pub use service::TaskService;
pub use spec::{CompletionHook, TaskRegistry, TaskSpec};
pub use task::{NewTask, Task, TaskId};

#[cfg(feature = "sqlite")]
pub use runner::SqliteTaskStore;
