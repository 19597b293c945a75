//! Recurring job integration tests.

use crate::common::{eventually, fast_scheduler, registry, wait_for_job_state};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use stint::testing::RecordingHandler;
use stint::{
    InMemoryStore, JobFilter, JobState, JobStore, QueueName, RecurringDefinition,
    RecurringJobRequest, RecurringKey, SqliteStore,
};

/// Test: Registering the same definition on every startup keeps one definition.
#[tokio::test]
async fn test_startup_registration_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stint.db");
    let request = RecurringJobRequest::new("print-time", "print-time", "@minutely");

    let mut next_fire_ats = Vec::new();
    for _ in 0..3 {
        let store = Arc::new(SqliteStore::new(&path).await.unwrap());
        let scheduler = fast_scheduler(
            Arc::clone(&store),
            registry!(("print-time", Arc::new(RecordingHandler::new()), None)),
        );
        let definition = scheduler
            .recurring()
            .add_or_update(request.clone())
            .await
            .unwrap();
        next_fire_ats.push(definition.next_fire_at);

        assert_eq!(store.list_recurring().await.unwrap().len(), 1);
        store.close().await;
    }

    // Re-registering the same schedule keeps the pending occurrence unless
    // it passed in the meantime.
    assert!(next_fire_ats.windows(2).all(|w| w[0] <= w[1]));
}

/// Test: A running scheduler fires a recurring definition into jobs.
#[tokio::test]
async fn test_scheduler_fires_recurring_definition() {
    let handler = Arc::new(RecordingHandler::new());
    let store = Arc::new(InMemoryStore::new());
    let scheduler = fast_scheduler(
        Arc::clone(&store),
        registry!(("tick", handler.clone(), None)),
    );
    scheduler
        .recurring()
        .add_or_update(
            RecurringJobRequest::new("every-second", "tick", "@every 1s")
                .with_arguments(json!({"source": "recurring"})),
        )
        .await
        .unwrap();
    let (handle, task) = scheduler.start().await;

    assert!(eventually(|| handler.call_count() >= 1).await);
    let call = &handler.calls()[0];
    assert_eq!(call.arguments, json!({"source": "recurring"}));

    let jobs = store
        .list_jobs(&JobFilter::default().with_job_type("tick"))
        .await
        .unwrap();
    assert!(
        jobs.iter()
            .all(|job| job.recurring_key == Some(RecurringKey::new("every-second")))
    );

    let definition = store
        .get_recurring(&RecurringKey::new("every-second"))
        .await
        .unwrap();
    assert!(definition.last_fired_at.is_some());
    assert!(definition.last_job_id.is_some());

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: A definition that missed many occurrences fires once and skips ahead.
#[tokio::test]
async fn test_missed_occurrences_fire_once() {
    let handler = Arc::new(RecordingHandler::new());
    let store = Arc::new(InMemoryStore::new());
    let now = Utc::now();

    // Stored by an earlier process that stopped long ago.
    store
        .upsert_recurring(RecurringDefinition {
            key: RecurringKey::new("yearly-report"),
            job_type: "report".to_string(),
            arguments: json!(null),
            queue: QueueName::default(),
            schedule_expression: "@yearly".to_string(),
            timezone: "UTC".to_string(),
            next_fire_at: now - chrono::Duration::days(3 * 365),
            last_fired_at: None,
            last_job_id: None,
            created_at: now - chrono::Duration::days(4 * 365),
            updated_at: now - chrono::Duration::days(4 * 365),
        })
        .await
        .unwrap();

    let scheduler = fast_scheduler(
        Arc::clone(&store),
        registry!(("report", handler.clone(), None)),
    );
    let (handle, task) = scheduler.start().await;

    assert!(eventually(|| handler.call_count() == 1).await);
    // Several more ticks pass without another instance.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handler.call_count(), 1);

    let definition = store
        .get_recurring(&RecurringKey::new("yearly-report"))
        .await
        .unwrap();
    assert!(definition.next_fire_at > now);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: Triggering a definition runs it now without moving its schedule.
#[tokio::test]
async fn test_trigger_runs_now() {
    let handler = Arc::new(RecordingHandler::new());
    let store = Arc::new(InMemoryStore::new());
    let scheduler = fast_scheduler(
        Arc::clone(&store),
        registry!(("report", handler.clone(), None)),
    );
    let recurring = scheduler.recurring();
    let definition = recurring
        .add_or_update(RecurringJobRequest::new("yearly-report", "report", "@yearly"))
        .await
        .unwrap();
    let (handle, task) = scheduler.start().await;

    let job = recurring
        .trigger(&RecurringKey::new("yearly-report"))
        .await
        .unwrap();
    wait_for_job_state(store.as_ref(), &job.id, JobState::Succeeded).await;
    assert_eq!(handler.call_count(), 1);

    let after = store
        .get_recurring(&RecurringKey::new("yearly-report"))
        .await
        .unwrap();
    assert_eq!(after.next_fire_at, definition.next_fire_at);
    assert_eq!(after.last_job_id, Some(job.id));

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

/// Test: Paused schedulers do not fire recurring definitions.
#[tokio::test]
async fn test_paused_scheduler_does_not_fire() {
    let handler = Arc::new(RecordingHandler::new());
    let store = Arc::new(InMemoryStore::new());
    let scheduler = fast_scheduler(
        Arc::clone(&store),
        registry!(("tick", handler.clone(), None)),
    );
    let recurring = scheduler.recurring();
    let (handle, task) = scheduler.start().await;
    handle.pause().await.unwrap();

    recurring
        .add_or_update(RecurringJobRequest::new("every-second", "tick", "@every 1s"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(handler.call_count(), 0);
    assert_eq!(store.count_by_state().await.unwrap().total(), 0);

    handle.resume().await.unwrap();
    assert!(eventually(|| handler.call_count() >= 1).await);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}
