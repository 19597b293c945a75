//! Recovery scenario integration tests.
//!
//! Tests that verify jobs survive a process restart and that work left
//! behind by a crashed process is picked up again.

use crate::common::{fast_scheduler, registry, wait_for_job_state};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use stint::testing::{GatedHandler, RecordingHandler};
use stint::{
    ConcurrencyLimit, Event, EventBus, EventHandler, InMemoryStore, JobState, JobStore, NewJob,
    QueueName, RequeueReason, SqliteStore,
};
use tokio::sync::Mutex;

/// Event handler that records requeue events.
struct RequeueRecorder {
    requeued: Mutex<Vec<(stint::JobId, RequeueReason)>>,
}

impl RequeueRecorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            requeued: Mutex::new(Vec::new()),
        })
    }

    async fn requeued(&self) -> Vec<(stint::JobId, RequeueReason)> {
        self.requeued.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl EventHandler for RequeueRecorder {
    async fn handle(&self, event: &Event) {
        if let Event::JobRequeued { job_id, reason, .. } = event {
            self.requeued.lock().await.push((job_id.clone(), *reason));
        }
    }
}

/// Test: A job left processing by a crashed process runs again after restart.
#[tokio::test]
async fn test_abandoned_job_recovered_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stint.db");

    // First process: claim a job, then "crash" without finishing it.
    let job_id = {
        let store = SqliteStore::new(&path).await.unwrap();
        let long_ago = Utc::now() - chrono::Duration::minutes(10);
        let job = store
            .create(NewJob::new("print", json!("Alice")), long_ago)
            .await
            .unwrap();
        let claimed = store
            .claim_next_ready(&QueueName::default(), "print", 1, long_ago)
            .await
            .unwrap()
            .expect("job is ready");
        assert_eq!(claimed.state, JobState::Processing);
        store.close().await;
        job.id
    };

    // Second process.
    let store = Arc::new(SqliteStore::new(&path).await.unwrap());
    let recorder = RequeueRecorder::new();
    let bus = EventBus::new();
    bus.register(recorder.clone()).await;

    let handler = Arc::new(RecordingHandler::new());
    let scheduler = fast_scheduler(
        Arc::clone(&store),
        registry!(("print", handler.clone(), None)),
    )
    .with_event_bus(bus)
    .with_invisibility_timeout(Duration::from_secs(60));
    let (handle, task) = scheduler.start().await;

    let done = wait_for_job_state(store.as_ref(), &job_id, JobState::Succeeded).await;
    assert_eq!(handler.call_count(), 1);
    assert_eq!(done.attempt, 1);
    assert_eq!(
        recorder.requeued().await,
        vec![(job_id.clone(), RequeueReason::Abandoned)]
    );

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: A processing job with a fresh heartbeat is left alone.
#[tokio::test]
async fn test_live_processing_job_not_recovered() {
    let store = Arc::new(InMemoryStore::new());
    let now = Utc::now();
    let job = store
        .create(NewJob::new("print", json!("Alice")), now)
        .await
        .unwrap();
    store
        .claim_next_ready(&QueueName::default(), "print", 1, now)
        .await
        .unwrap();

    let handler = Arc::new(RecordingHandler::new());
    let scheduler = fast_scheduler(
        Arc::clone(&store),
        registry!(("print", handler.clone(), None)),
    )
    .with_invisibility_timeout(Duration::from_secs(60));
    let (handle, task) = scheduler.start().await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        store.get_job(&job.id).await.unwrap().state,
        JobState::Processing
    );
    assert_eq!(handler.call_count(), 0);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: Jobs and their states survive reopening the database.
#[tokio::test]
async fn test_jobs_persist_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stint.db");

    let (done_id, waiting_id) = {
        let store = Arc::new(SqliteStore::new(&path).await.unwrap());
        let handler = Arc::new(RecordingHandler::new());
        let scheduler = fast_scheduler(
            Arc::clone(&store),
            registry!(("print", handler.clone(), None)),
        );
        let client = scheduler.client();
        let (handle, task) = scheduler.start().await;

        let done = client.enqueue("print", "Alice").await.unwrap();
        let waiting = client
            .schedule("print", "Bob", Duration::from_secs(3600))
            .await
            .unwrap();
        wait_for_job_state(store.as_ref(), &done.id, JobState::Succeeded).await;

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        store.close().await;
        (done.id, waiting.id)
    };

    let store = SqliteStore::new(&path).await.unwrap();
    assert_eq!(
        store.get_job(&done_id).await.unwrap().state,
        JobState::Succeeded
    );
    let waiting = store.get_job(&waiting_id).await.unwrap();
    assert_eq!(waiting.state, JobState::Scheduled);
    assert_eq!(waiting.arguments, json!("Bob"));

    let counts = store.count_by_state().await.unwrap();
    assert_eq!(counts.succeeded, 1);
    assert_eq!(counts.scheduled, 1);
}

/// Test: Two schedulers sharing one store respect a type limit together.
#[tokio::test]
async fn test_type_limit_holds_across_schedulers_sharing_a_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stint.db");
    let store = Arc::new(SqliteStore::new(&path).await.unwrap());
    let limit = Some(ConcurrencyLimit::exclusive(Duration::from_secs(5)));

    let left = Arc::new(GatedHandler::new());
    let right = Arc::new(GatedHandler::new());
    let first = fast_scheduler(
        Arc::clone(&store),
        registry!(("report", left.clone(), limit)),
    );
    let second = fast_scheduler(
        Arc::clone(&store),
        registry!(("report", right.clone(), limit)),
    );
    let client = first.client();
    let (first_handle, first_task) = first.start().await;
    let (second_handle, second_task) = second.start().await;

    let a = client.enqueue("report", "a").await.unwrap();
    let b = client.enqueue("report", "b").await.unwrap();

    assert!(crate::common::eventually(|| left.started() + right.started() == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(left.started() + right.started(), 1);
    assert_eq!(store.count_by_state().await.unwrap().processing, 1);

    left.open();
    right.open();
    wait_for_job_state(store.as_ref(), &a.id, JobState::Succeeded).await;
    wait_for_job_state(store.as_ref(), &b.id, JobState::Succeeded).await;
    assert_eq!(left.finished() + right.finished(), 2);

    first_handle.shutdown().await.unwrap();
    second_handle.shutdown().await.unwrap();
    first_task.await.unwrap();
    second_task.await.unwrap();
}
