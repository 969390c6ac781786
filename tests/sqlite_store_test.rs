//! Tests for SqliteTaskStore.

use chrono::{Duration as ChronoDuration, Utc};
use deltatask::{
    handler_fn, HandlerError, NewTask, Progress, RetryPolicy, RunnerBuilder, SqliteTaskStore,
    Task, TaskError, TaskSpec, TaskStore,
};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use std::time::Duration;

async fn setup_store() -> SqliteTaskStore {
    // A single connection keeps every query on the same in-memory database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = SqliteTaskStore::new(pool);
    store.run_migrations().await.unwrap();
    store
}

async fn enqueue(store: &SqliteTaskStore, new: NewTask) -> deltatask::TaskId {
    store.create(Task::from_new(new, Utc::now())).await.unwrap()
}

fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
async fn test_create_and_find_one() {
    let store = setup_store().await;

    let data = json!({"video_id": 123});
    let id = enqueue(&store, NewTask::new("process_video", data.clone()).priority(3)).await;

    let task = store.find_one(id).await.unwrap().unwrap();
    assert_eq!(task.id, id);
    assert_eq!(task.name, "process_video");
    assert_eq!(task.data, data);
    assert_eq!(task.priority, 3);
    assert_eq!(task.try_count, 0);
    assert!(task.result.is_none());
    assert!(!task.running && !task.complete && !task.cancelled);

    assert!(store.find_one(deltatask::TaskId(999)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_find_eligible_respects_limit() {
    let store = setup_store().await;

    for i in 0..5 {
        enqueue(&store, NewTask::new("work", json!({"n": i}))).await;
    }

    let tasks = store
        .find_eligible(&names(&["work"]), 2, Utc::now())
        .await
        .unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(store
        .find_eligible(&names(&["work"]), 0, Utc::now())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_find_eligible_orders_by_priority_then_fifo() {
    let store = setup_store().await;

    let id1 = enqueue(&store, NewTask::new("p", json!(1))).await;
    let id2 = enqueue(&store, NewTask::new("p", json!(2))).await;
    let urgent = enqueue(&store, NewTask::new("p", json!(3)).priority(5)).await;

    let tasks = store.find_eligible(&names(&["p"]), 10, Utc::now()).await.unwrap();
    let ids: Vec<_> = tasks.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![urgent, id1, id2]);
}

#[tokio::test]
async fn test_find_eligible_filters_names_and_state() {
    let store = setup_store().await;

    let a = enqueue(&store, NewTask::new("task_a", json!(1))).await;
    enqueue(&store, NewTask::new("task_b", json!(2))).await;
    enqueue(
        &store,
        NewTask::new("task_a", json!(3)).run_at(Utc::now() + ChronoDuration::hours(1)),
    )
    .await;
    let cancelled = enqueue(&store, NewTask::new("task_a", json!(4))).await;
    store.cancel(cancelled).await.unwrap();

    let tasks = store
        .find_eligible(&names(&["task_a"]), 10, Utc::now())
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, a);

    let both = store
        .find_eligible(&names(&["task_a", "task_b"]), 10, Utc::now())
        .await
        .unwrap();
    assert_eq!(both.len(), 2);
    assert!(store.find_eligible(&[], 10, Utc::now()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_mark_started_is_exclusive() {
    let store = setup_store().await;
    let id = enqueue(&store, NewTask::new("p", json!(null))).await;

    let mut task = store.find_one(id).await.unwrap().unwrap();
    task.mark_started(Utc::now());
    assert!(store.mark_started(&task).await.unwrap());
    assert!(!store.mark_started(&task).await.unwrap());

    let stored = store.find_one(id).await.unwrap().unwrap();
    assert!(stored.running);
    assert!(stored.started_at.is_some());
    assert!(store
        .find_eligible(&names(&["p"]), 10, Utc::now())
        .await
        .unwrap()
        .is_empty());

    assert!(matches!(
        store.cancel(id).await,
        Err(TaskError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_cancel_wins_over_mark_started() {
    let store = setup_store().await;
    let id = enqueue(&store, NewTask::new("p", json!(null))).await;

    let mut polled = store.find_one(id).await.unwrap().unwrap();
    let cancelled = store.cancel(id).await.unwrap();
    assert!(cancelled.cancelled);

    polled.mark_started(Utc::now());
    assert!(!store.mark_started(&polled).await.unwrap());
    assert!(!store.find_one(id).await.unwrap().unwrap().running);
}

#[tokio::test]
async fn test_update_persists_outcome() {
    let store = setup_store().await;
    let id = enqueue(&store, NewTask::new("p", json!(21))).await;

    let mut task = store.find_one(id).await.unwrap().unwrap();
    task.mark_started(Utc::now());
    store.mark_started(&task).await.unwrap();
    task.apply_outcome(Ok(json!(42)), &RetryPolicy::None, Utc::now());
    store.update(&task).await.unwrap();

    let stored = store.find_one(id).await.unwrap().unwrap();
    assert!(stored.complete && stored.success);
    assert!(!stored.running);
    assert_eq!(stored.result, Some(json!(42)));
    assert_eq!(stored.try_count, 1);
    assert!(stored.finished_at.is_some());

    task.id = deltatask::TaskId(999);
    assert!(matches!(
        store.update(&task).await,
        Err(TaskError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_update_progress_ignored_after_finish() {
    let store = setup_store().await;
    let id = enqueue(&store, NewTask::new("p", json!(null))).await;

    let mut task = store.find_one(id).await.unwrap().unwrap();
    task.progress = 10;
    store.update_progress(&task).await.unwrap();
    assert_eq!(store.find_one(id).await.unwrap().unwrap().progress, 0);

    task.mark_started(Utc::now());
    store.mark_started(&task).await.unwrap();
    task.progress = 40;
    task.log = "step one".into();
    store.update_progress(&task).await.unwrap();

    let stored = store.find_one(id).await.unwrap().unwrap();
    assert_eq!(stored.progress, 40);
    assert_eq!(stored.log, "step one");
}

#[tokio::test]
async fn test_runner_with_sqlite_store() {
    let store = setup_store().await;
    let runner = RunnerBuilder::new(store)
        .poll_interval(Duration::from_millis(20))
        .task(TaskSpec::new(
            "double",
            handler_fn(|task: Task, _progress: Progress| async move {
                let n: i64 = serde_json::from_value(task.data).map_err(HandlerError::permanent)?;
                Ok::<_, HandlerError>(json!(n * 2))
            }),
        ))
        .build();
    let service = runner.service();
    let handle = runner.start();

    let id = service.queue_data("double", &22).await.unwrap();
    let task = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let task = service.get_task(id).await.unwrap().unwrap();
            if task.complete {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task did not complete in time");

    assert!(task.success);
    assert_eq!(task.result, Some(json!(44)));

    handle.shutdown().await.unwrap();
}
