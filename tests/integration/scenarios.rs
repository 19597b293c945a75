//! End-to-end job scenarios through a running scheduler.

use crate::common::{WAIT, eventually, fast_scheduler, registry, wait_for_job_state};
use std::sync::Arc;
use std::time::Duration;
use stint::demo::{self, Console, DemoHandlers};
use stint::testing::{FailingHandler, FlakyStore, RecordingHandler};
use stint::{
    ConcurrencyLimit, HandlerRegistry, InMemoryStore, JobFilter, JobState, JobStore, RetryPolicy,
};

/// Test: A delayed `print` job waits, then runs once its fire time passes.
#[tokio::test]
async fn test_delayed_print_job_runs_after_delay() {
    let console = Console::capture();
    let mut handlers = HandlerRegistry::new();
    DemoHandlers::new()
        .with_console(console.clone())
        .register(&mut handlers);

    let store = Arc::new(InMemoryStore::new());
    let scheduler = fast_scheduler(Arc::clone(&store), handlers);
    let client = scheduler.client();
    let (handle, task) = scheduler.start().await;

    let job = client
        .schedule(demo::PRINT, "Alice", Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Scheduled);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        store.get_job(&job.id).await.unwrap().state,
        JobState::Scheduled
    );
    assert!(console.lines().is_empty());

    let done = wait_for_job_state(store.as_ref(), &job.id, JobState::Succeeded).await;
    let claimed_at = done.claimed_at.expect("claimed job has a claim time");
    assert!(claimed_at >= job.fire_at);
    assert_eq!(console.lines(), vec!["The name is Alice"]);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: Two jobs of a type limited to one never overlap.
#[tokio::test]
async fn test_type_limit_serializes_executions() {
    let handler = Arc::new(RecordingHandler::new().with_delay(Duration::from_millis(100)));
    let store = Arc::new(InMemoryStore::new());
    let scheduler = fast_scheduler(
        Arc::clone(&store),
        registry!((
            "print",
            handler.clone(),
            Some(ConcurrencyLimit::exclusive(Duration::from_secs(5))),
        )),
    )
    .with_workers(4);
    let client = scheduler.client();
    let (handle, task) = scheduler.start().await;

    let first = client.enqueue("print", "Alice").await.unwrap();
    let second = client.enqueue("print", "Bob").await.unwrap();

    wait_for_job_state(store.as_ref(), &first.id, JobState::Succeeded).await;
    wait_for_job_state(store.as_ref(), &second.id, JobState::Succeeded).await;

    assert_eq!(handler.max_concurrent(), 1);
    let spans = handler.spans();
    assert_eq!(spans.len(), 2);
    assert!(spans[0].1 <= spans[1].0, "second job started before first finished");

    // Same queue, same key: insertion order is kept.
    let names: Vec<_> = handler.calls().into_iter().map(|c| c.arguments).collect();
    assert_eq!(names, vec![serde_json::json!("Alice"), serde_json::json!("Bob")]);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: Without a limit, jobs of one type run side by side.
#[tokio::test]
async fn test_unlimited_type_runs_in_parallel() {
    let handler = Arc::new(RecordingHandler::new().with_delay(Duration::from_millis(200)));
    let store = Arc::new(InMemoryStore::new());
    let scheduler = fast_scheduler(
        Arc::clone(&store),
        registry!(("print", handler.clone(), None)),
    )
    .with_workers(3);
    let client = scheduler.client();
    let (handle, task) = scheduler.start().await;

    let mut ids = Vec::new();
    for name in ["a", "b", "c"] {
        ids.push(client.enqueue("print", name).await.unwrap().id);
    }
    for id in &ids {
        wait_for_job_state(store.as_ref(), id, JobState::Succeeded).await;
    }
    assert!(handler.max_concurrent() >= 2);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: A continuation runs only after its parent succeeds.
#[tokio::test]
async fn test_continuation_runs_after_parent() {
    let handler = Arc::new(RecordingHandler::new().with_delay(Duration::from_millis(50)));
    let store = Arc::new(InMemoryStore::new());
    let scheduler = fast_scheduler(
        Arc::clone(&store),
        registry!(("print", handler.clone(), None)),
    );
    let client = scheduler.client();
    let (handle, task) = scheduler.start().await;

    let parent = client
        .schedule("print", "parent", Duration::from_secs(1))
        .await
        .unwrap();
    let child = client
        .continue_with(&parent.id, "print", "child")
        .await
        .unwrap();
    assert_eq!(child.state, JobState::Scheduled);

    let parent = wait_for_job_state(store.as_ref(), &parent.id, JobState::Succeeded).await;
    let child = wait_for_job_state(store.as_ref(), &child.id, JobState::Succeeded).await;

    let parent_finished = parent.finished_at.expect("finished parent");
    let child_claimed = child.claimed_at.expect("claimed child");
    assert!(child_claimed >= parent_finished);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: A continuation of a failed parent stays scheduled.
#[tokio::test]
async fn test_continuation_of_failed_parent_stays_scheduled() {
    let failing = Arc::new(FailingHandler::new(u32::MAX));
    let follow_up = Arc::new(RecordingHandler::new());
    let store = Arc::new(InMemoryStore::new());
    let scheduler = fast_scheduler(
        Arc::clone(&store),
        registry!(
            ("flaky", failing.clone(), None),
            ("print", follow_up.clone(), None),
        ),
    )
    .with_retry_policy(RetryPolicy::none());
    let client = scheduler.client();

    // Create both before starting so the child exists before the parent runs.
    let parent = client.enqueue("flaky", "A").await.unwrap();
    let child = client.continue_with(&parent.id, "print", "B").await.unwrap();

    let (handle, task) = scheduler.start().await;

    let failed = wait_for_job_state(store.as_ref(), &parent.id, JobState::Failed).await;
    assert!(failed.last_error.is_some());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        store.get_job(&child.id).await.unwrap().state,
        JobState::Scheduled
    );
    assert_eq!(follow_up.call_count(), 0);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: A failing job is retried with backoff until it succeeds.
#[tokio::test]
async fn test_failed_job_retries_until_success() {
    let failing = Arc::new(FailingHandler::new(2));
    let store = Arc::new(InMemoryStore::new());
    let scheduler = fast_scheduler(
        Arc::clone(&store),
        registry!(("flaky", failing.clone(), None)),
    );
    let client = scheduler.client();
    let (handle, task) = scheduler.start().await;

    let first = client.enqueue("flaky", "A").await.unwrap();
    wait_for_job_state(store.as_ref(), &first.id, JobState::Failed).await;

    let filter = JobFilter::default().with_job_type("flaky");
    assert!(
        eventually(|| failing.call_count() == 3).await,
        "handler was not retried"
    );

    let mut attempts = Vec::new();
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        attempts = store.list_jobs(&filter).await.unwrap();
        if attempts.iter().any(|job| job.state == JobState::Succeeded) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(attempts.len(), 3);
    let last = attempts
        .iter()
        .find(|job| job.state == JobState::Succeeded)
        .expect("a retry succeeded");
    assert_eq!(last.attempt, 3);
    assert_eq!(last.retry_of.as_ref(), Some(&first.id));
    assert_eq!(
        attempts
            .iter()
            .filter(|job| job.state == JobState::Failed)
            .count(),
        2
    );

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: A job that exhausts its attempts stays failed.
#[tokio::test]
async fn test_exhausted_retries_stay_failed() {
    let failing = Arc::new(FailingHandler::with_error(u32::MAX, "always broken"));
    let store = Arc::new(InMemoryStore::new());
    let scheduler = fast_scheduler(
        Arc::clone(&store),
        registry!(("flaky", failing.clone(), None)),
    );
    let client = scheduler.client();
    let (handle, task) = scheduler.start().await;

    client.enqueue("flaky", "A").await.unwrap();
    // The first run plus three retries.
    assert!(eventually(|| failing.call_count() == 4).await);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(failing.call_count(), 4);

    let jobs = store
        .list_jobs(&JobFilter::default().with_job_type("flaky"))
        .await
        .unwrap();
    assert_eq!(jobs.len(), 4);
    assert_eq!(jobs.last().map(|job| job.attempt), Some(4));
    assert!(jobs.iter().all(|job| job.state == JobState::Failed));
    assert!(
        jobs.iter()
            .all(|job| job.last_error.as_deref().is_some_and(|e| e.contains("always broken")))
    );

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: The scheduler rides out a store outage and resumes dispatching.
#[tokio::test]
async fn test_scheduler_survives_store_outage() {
    let handler = Arc::new(RecordingHandler::new());
    let store = Arc::new(FlakyStore::new(InMemoryStore::new()));
    let scheduler = fast_scheduler(
        Arc::clone(&store),
        registry!(("print", handler.clone(), None)),
    );
    let client = scheduler.client();

    store.set_unavailable(true);
    let (handle, task) = scheduler.start().await;
    assert!(client.enqueue("print", "Alice").await.is_err());

    assert!(eventually(|| store.rejected() >= 2).await);
    assert!(handle.is_running().await);

    store.set_unavailable(false);
    let job = client.enqueue("print", "Alice").await.unwrap();
    wait_for_job_state(store.as_ref(), &job.id, JobState::Succeeded).await;
    assert_eq!(handler.call_count(), 1);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}
