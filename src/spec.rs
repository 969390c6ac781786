//! Task specifications and the registry that resolves them by name.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::handler::TaskHandler;
use crate::retry::RetryPolicy;
use crate::task::Task;

/// Callback invoked after every finished attempt of a task of a given type,
/// once the attempt's outcome has been persisted.
///
/// Attempts that were rescheduled for retry also trigger it; check
/// `task.complete` to act only on the final outcome. Runs detached from the
/// dispatch loop; its outcome, including a panic, is not observed.
#[async_trait]
pub trait CompletionHook: Send + Sync {
    async fn on_complete(&self, task: &Task);
}

/// A task type: handler plus retry policy and an optional completion hook.
#[derive(Clone)]
pub struct TaskSpec {
    name: String,
    retry: RetryPolicy,
    handler: Arc<dyn TaskHandler>,
    on_complete: Option<Arc<dyn CompletionHook>>,
}

impl TaskSpec {
    /// Create a spec with no retries.
    pub fn new(name: impl Into<String>, handler: impl TaskHandler + 'static) -> Self {
        Self {
            name: name.into(),
            retry: RetryPolicy::None,
            handler: Arc::new(handler),
            on_complete: None,
        }
    }

    /// Allow up to `allowed_retries` attempts, `interval` apart.
    pub fn with_retries(self, allowed_retries: u32, interval: Duration) -> Self {
        self.with_retry(RetryPolicy::fixed(allowed_retries, interval))
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Register a hook that runs after each finished attempt of this type.
    pub fn on_complete(mut self, hook: impl CompletionHook + 'static) -> Self {
        self.on_complete = Some(Arc::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn handler(&self) -> &Arc<dyn TaskHandler> {
        &self.handler
    }

    pub fn completion_hook(&self) -> Option<&Arc<dyn CompletionHook>> {
        self.on_complete.as_ref()
    }
}

impl std::fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// Registered task specifications keyed by name.
///
/// Populated during setup, before the runner starts; read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    specs: HashMap<String, Arc<TaskSpec>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spec, replacing any earlier spec with the same name.
    ///
    /// # Panics
    ///
    /// Panics if the task spec's name is empty.
    pub fn register(&mut self, spec: TaskSpec) {
        assert!(
            !spec.name().is_empty(),
            "task spec must have a non-empty name"
        );
        self.specs.insert(spec.name.clone(), Arc::new(spec));
    }

    /// Look up the spec for a task name.
    pub fn get(&self, name: &str) -> Option<&Arc<TaskSpec>> {
        self.specs.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.contains_key(name)
    }

    /// Names of all registered task types, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.specs.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn specs(&self) -> impl Iterator<Item = &Arc<TaskSpec>> {
        self.specs.values()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}
