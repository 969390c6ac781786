//! Progress writes and completion hooks are best effort: their failures never
//! reach the task outcome or stop the runner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deltatask::{
    handler_fn, CompletionHook, HandlerError, MemoryTaskStore, NewTask, Progress, RunnerBuilder,
    Task, TaskError, TaskId, TaskService, TaskSpec, TaskStore,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Store whose progress writes always fail.
struct FailingProgressStore {
    inner: MemoryTaskStore,
    progress_calls: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskStore for FailingProgressStore {
    async fn create(&self, task: Task) -> Result<TaskId, TaskError> {
        self.inner.create(task).await
    }

    async fn update(&self, task: &Task) -> Result<(), TaskError> {
        self.inner.update(task).await
    }

    async fn update_progress(&self, _task: &Task) -> Result<(), TaskError> {
        self.progress_calls.fetch_add(1, Ordering::SeqCst);
        Err(TaskError::StorageError("disk full".into()))
    }

    async fn mark_started(&self, task: &Task) -> Result<bool, TaskError> {
        self.inner.mark_started(task).await
    }

    async fn cancel(&self, id: TaskId) -> Result<Task, TaskError> {
        self.inner.cancel(id).await
    }

    async fn find_one(&self, id: TaskId) -> Result<Option<Task>, TaskError> {
        self.inner.find_one(id).await
    }

    async fn find_eligible(
        &self,
        names: &[String],
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Task>, TaskError> {
        self.inner.find_eligible(names, limit, now).await
    }
}

struct PanickingHook {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl CompletionHook for PanickingHook {
    async fn on_complete(&self, _task: &Task) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("hook blew up");
    }
}

fn reporting_spec() -> TaskSpec {
    TaskSpec::new(
        "report",
        handler_fn(|task: Task, progress: Progress| async move {
            progress.log("working");
            progress.report(50);
            tokio::time::sleep(Duration::from_millis(20)).await;
            progress.report(100);
            Ok::<_, HandlerError>(task.data)
        }),
    )
}

async fn wait_complete<S: TaskStore>(service: &TaskService<S>, id: TaskId) -> Task {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let task = service.get_task(id).await.unwrap().unwrap();
            if task.complete {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task did not complete in time")
}

#[tokio::test]
async fn test_failed_progress_writes_do_not_affect_outcome() {
    let progress_calls = Arc::new(AtomicUsize::new(0));
    let store = FailingProgressStore {
        inner: MemoryTaskStore::new(),
        progress_calls: progress_calls.clone(),
    };
    let runner = RunnerBuilder::new(store)
        .concurrency_limit(1)
        .poll_interval(Duration::from_millis(10))
        .task(reporting_spec())
        .build();
    let service = runner.service();
    let handle = runner.start();

    let first = service.queue(NewTask::new("report", json!(1))).await.unwrap();
    let second = service.queue(NewTask::new("report", json!(2))).await.unwrap();

    let first = wait_complete(&service, first).await;
    let second = wait_complete(&service, second).await;

    for (task, expected) in [(first, json!(1)), (second, json!(2))] {
        assert!(task.success);
        assert_eq!(task.result, Some(expected));
        // The final outcome write still carries the last snapshot.
        assert_eq!(task.progress, 100);
        assert_eq!(task.log, "working");
    }
    assert!(progress_calls.load(Ordering::SeqCst) > 0);

    assert!(!handle.is_finished());
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_panicking_hook_does_not_stop_dispatch() {
    let hook_calls = Arc::new(AtomicUsize::new(0));
    let runner = RunnerBuilder::new(MemoryTaskStore::new())
        .concurrency_limit(1)
        .poll_interval(Duration::from_millis(10))
        .task(reporting_spec().on_complete(PanickingHook {
            calls: hook_calls.clone(),
        }))
        .build();
    let service = runner.service();
    let handle = runner.start();

    let first = service.queue(NewTask::new("report", json!("a"))).await.unwrap();
    let first = wait_complete(&service, first).await;
    assert!(first.success);

    let second = service.queue(NewTask::new("report", json!("b"))).await.unwrap();
    let second = wait_complete(&service, second).await;
    assert!(second.success);
    assert_eq!(second.result, Some(json!("b")));

    tokio::time::timeout(Duration::from_secs(1), async {
        while hook_calls.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("hook was not invoked for both tasks");

    assert!(!handle.is_finished());
    handle.shutdown().await.unwrap();
}
