//! Behavior every `JobStore` backend must share.
//!
//! Each check is written once against the trait and run against the
//! in-memory store and a SQLite file.

use chrono::{Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use stint::{
    InMemoryStore, JobFilter, JobState, JobStore, NewJob, QueueName, SqliteStore, StorageError,
};

async fn claim_has_single_winner<S: JobStore + 'static>(store: Arc<S>) {
    let now = Utc::now();
    let job = store
        .create(NewJob::new("print", json!("Alice")), now)
        .await
        .unwrap();

    let mut claimers = Vec::new();
    for _ in 0..16 {
        let store = Arc::clone(&store);
        claimers.push(tokio::spawn(async move {
            store
                .claim_next_ready(&QueueName::default(), "print", 16, now)
                .await
        }));
    }

    let mut winners = Vec::new();
    for claimer in claimers {
        if let Ok(Some(claimed)) = claimer.await.unwrap() {
            winners.push(claimed.id);
        }
    }
    assert_eq!(winners, vec![job.id.clone()]);
    assert_eq!(
        store.get_job(&job.id).await.unwrap().state,
        JobState::Processing
    );
}

async fn claims_respect_concurrency_limit<S: JobStore>(store: Arc<S>) {
    let now = Utc::now();
    for name in ["a", "b", "c"] {
        store
            .create(NewJob::new("report", json!(name)), now)
            .await
            .unwrap();
    }

    let queue = QueueName::default();
    assert!(store.claim_next_ready(&queue, "report", 2, now).await.unwrap().is_some());
    assert!(store.claim_next_ready(&queue, "report", 2, now).await.unwrap().is_some());
    assert!(store.claim_next_ready(&queue, "report", 2, now).await.unwrap().is_none());
    assert_eq!(store.count_by_state().await.unwrap().processing, 2);
}

async fn claims_follow_insertion_order<S: JobStore>(store: Arc<S>) {
    let now = Utc::now();
    let mut created = Vec::new();
    for name in ["first", "second", "third"] {
        created.push(
            store
                .create(NewJob::new("print", json!(name)), now)
                .await
                .unwrap()
                .id,
        );
    }

    let mut claimed = Vec::new();
    while let Some(job) = store
        .claim_next_ready(&QueueName::default(), "print", 10, now)
        .await
        .unwrap()
    {
        claimed.push(job.id);
    }
    assert_eq!(claimed, created);
}

async fn claims_stay_in_their_queue<S: JobStore>(store: Arc<S>) {
    let now = Utc::now();
    store
        .create(NewJob::new("print", json!("x")).with_queue("critical"), now)
        .await
        .unwrap();

    let none = store
        .claim_next_ready(&QueueName::default(), "print", 10, now)
        .await
        .unwrap();
    assert!(none.is_none());

    let claimed = store
        .claim_next_ready(&QueueName::new("critical"), "print", 10, now)
        .await
        .unwrap()
        .expect("job in critical queue");
    assert_eq!(claimed.queue, QueueName::new("critical"));
}

async fn only_allowed_transitions_succeed<S: JobStore>(store: Arc<S>) {
    let now = Utc::now();
    let job = store
        .create(NewJob::new("print", json!("Alice")), now)
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Enqueued);

    // Not processing yet.
    let err = store.mark_succeeded(&job.id, now).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidTransition { .. }));
    let err = store.requeue(&job.id, now).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidTransition { .. }));

    store
        .claim_next_ready(&QueueName::default(), "print", 1, now)
        .await
        .unwrap()
        .expect("job is ready");
    let err = store.delete_job(&job.id, now).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidTransition { .. }));

    let done = store.mark_succeeded(&job.id, now).await.unwrap();
    assert_eq!(done.state, JobState::Succeeded);
    assert!(done.finished_at.is_some());

    // Finished jobs are final.
    let err = store.delete_job(&job.id, now).await.unwrap_err();
    assert!(matches!(err, StorageError::InvalidTransition { .. }));
    let err = store
        .mark_failed(&job.id, "late", None, now)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidTransition { .. }));

    let missing = stint::JobId::new();
    let err = store.mark_succeeded(&missing, now).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound(_)));
}

async fn delayed_jobs_wait_for_fire_time<S: JobStore>(store: Arc<S>) {
    let now = Utc::now();
    let later = now + Duration::seconds(30);
    let job = store
        .create(NewJob::new("print", json!("later")).with_fire_at(later), now)
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Scheduled);

    assert!(store.promote_scheduled_to_enqueued(now).await.unwrap().is_empty());
    assert!(
        store
            .claim_next_ready(&QueueName::default(), "print", 1, now)
            .await
            .unwrap()
            .is_none()
    );

    let promoted = store.promote_scheduled_to_enqueued(later).await.unwrap();
    assert_eq!(promoted, vec![job.id.clone()]);
    assert_eq!(
        store.get_job(&job.id).await.unwrap().state,
        JobState::Enqueued
    );
}

async fn continuation_waits_for_parent<S: JobStore>(store: Arc<S>) {
    let now = Utc::now();
    let parent = store
        .create(NewJob::new("print", json!("parent")), now)
        .await
        .unwrap();
    let child = store
        .create(
            NewJob::new("print", json!("child")).with_continuation_of(parent.id.clone()),
            now,
        )
        .await
        .unwrap();
    assert_eq!(child.state, JobState::Scheduled);

    // Due, but the parent has not succeeded.
    assert!(store.promote_scheduled_to_enqueued(now).await.unwrap().is_empty());

    store
        .claim_next_ready(&QueueName::default(), "print", 1, now)
        .await
        .unwrap()
        .expect("parent is ready");
    assert!(store.promote_scheduled_to_enqueued(now).await.unwrap().is_empty());

    store.mark_succeeded(&parent.id, now).await.unwrap();
    let promoted = store.promote_continuations(&parent.id, now).await.unwrap();
    assert_eq!(promoted, vec![child.id.clone()]);

    // A child created after its parent succeeded starts enqueued.
    let late = store
        .create(
            NewJob::new("print", json!("late")).with_continuation_of(parent.id.clone()),
            now,
        )
        .await
        .unwrap();
    assert_eq!(late.state, JobState::Enqueued);

    let orphan = store
        .create(
            NewJob::new("print", json!("orphan")).with_continuation_of(stint::JobId::new()),
            now,
        )
        .await
        .unwrap_err();
    assert!(matches!(orphan, StorageError::NotFound(_)));
}

async fn retry_moves_continuations<S: JobStore>(store: Arc<S>) {
    let now = Utc::now();
    let parent = store
        .create(NewJob::new("flaky", json!("A")), now)
        .await
        .unwrap();
    let child = store
        .create(
            NewJob::new("print", json!("B")).with_continuation_of(parent.id.clone()),
            now,
        )
        .await
        .unwrap();
    store
        .claim_next_ready(&QueueName::default(), "flaky", 1, now)
        .await
        .unwrap()
        .expect("parent is ready");

    let retry_at = now + Duration::seconds(5);
    let outcome = store
        .mark_failed(&parent.id, "boom", Some(retry_at), now)
        .await
        .unwrap();
    assert_eq!(outcome.failed.state, JobState::Failed);
    assert_eq!(outcome.failed.last_error.as_deref(), Some("boom"));
    let retry = outcome.retry.expect("retry scheduled");
    assert_eq!(retry.state, JobState::Scheduled);
    assert_eq!(retry.attempt, 2);
    assert_eq!(retry.retry_of.as_ref(), Some(&parent.id));
    assert_eq!(outcome.moved_continuations, vec![child.id.clone()]);

    let child = store.get_job(&child.id).await.unwrap();
    assert_eq!(child.continuation_of.as_ref(), Some(&retry.id));
    assert_eq!(child.state, JobState::Scheduled);
}

async fn abandoned_jobs_are_requeued<S: JobStore>(store: Arc<S>) {
    let long_ago = Utc::now() - Duration::minutes(10);
    let now = Utc::now();
    let stale = store
        .create(NewJob::new("print", json!("stale")), long_ago)
        .await
        .unwrap();
    store
        .claim_next_ready(&QueueName::default(), "print", 10, long_ago)
        .await
        .unwrap();
    let fresh = store
        .create(NewJob::new("print", json!("fresh")), now)
        .await
        .unwrap();
    store
        .claim_next_ready(&QueueName::default(), "print", 10, now)
        .await
        .unwrap();

    let requeued = store
        .requeue_abandoned(now - Duration::minutes(5), now)
        .await
        .unwrap();
    assert_eq!(requeued, vec![stale.id.clone()]);
    assert_eq!(
        store.get_job(&stale.id).await.unwrap().state,
        JobState::Enqueued
    );
    assert_eq!(
        store.get_job(&fresh.id).await.unwrap().state,
        JobState::Processing
    );

    let filtered = store
        .list_jobs(&JobFilter::default().with_state(JobState::Processing))
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
}

async fn sqlite_store() -> (tempfile::TempDir, Arc<SqliteStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("contract.db"))
        .await
        .unwrap();
    (dir, Arc::new(store))
}

macro_rules! store_contract {
    ($($name:ident),* $(,)?) => {
        mod memory {
            use super::*;
            $(
                #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
                async fn $name() {
                    super::$name(Arc::new(InMemoryStore::new())).await;
                }
            )*
        }

        mod sqlite {
            use super::*;
            $(
                #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
                async fn $name() {
                    let (_dir, store) = sqlite_store().await;
                    super::$name(store).await;
                }
            )*
        }
    };
}

store_contract!(
    claim_has_single_winner,
    claims_respect_concurrency_limit,
    claims_follow_insertion_order,
    claims_stay_in_their_queue,
    only_allowed_transitions_succeed,
    delayed_jobs_wait_for_fire_time,
    continuation_waits_for_parent,
    retry_moves_continuations,
    abandoned_jobs_are_requeued,
);
