//! Task runner module.

mod dispatch;
mod executor;
pub mod memory_store;
#[allow(clippy::module_inception)]
mod runner;
pub mod store;

#[cfg(feature = "sqlite")]
pub mod sqlite_store;

pub use memory_store::MemoryTaskStore;
pub use runner::{Runner, RunnerBuilder, RunnerError, RunnerHandle};
pub use store::{TaskError, TaskStore};

#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteTaskStore;
