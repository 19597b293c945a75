//! Storage abstraction for jobs and recurring definitions.
//!
//! Every state transition goes through the [`JobStore`] trait and is atomic
//! in each backend. Operations take an explicit `now` where time matters.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

use crate::core::job::{FailureOutcome, JobFilter, JobRecord, JobState, NewJob, StateCounts};
use crate::core::recurring::RecurringDefinition;
use crate::core::types::{JobId, QueueName, RecurringKey};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// The job is not in a state that allows the transition.
    #[error("invalid transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },

    /// The store cannot be reached.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

impl StorageError {
    pub(crate) fn job_not_found(id: &JobId) -> Self {
        StorageError::NotFound(format!("job: {}", id))
    }

    pub(crate) fn recurring_not_found(key: &RecurringKey) -> Self {
        StorageError::NotFound(format!("recurring job: {}", key))
    }
}

/// Persistence for jobs and recurring definitions.
#[async_trait]
pub trait JobStore: Send + Sync {
    // Job operations

    /// Insert a job.
    ///
    /// The job starts `Enqueued` when its fire time has passed and its parent,
    /// if any, has succeeded; otherwise `Scheduled`. Fails with `NotFound`
    /// when the parent does not exist.
    async fn create(&self, job: NewJob, now: DateTime<Utc>) -> Result<JobRecord, StorageError>;

    /// Get a job by ID.
    async fn get_job(&self, id: &JobId) -> Result<JobRecord, StorageError>;

    /// List jobs matching the filter, in insertion order.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StorageError>;

    /// Claim the oldest ready job of a queue and concurrency key.
    ///
    /// Returns `None` when nothing is ready or when `max_concurrent` jobs
    /// with that key are already processing. No two callers ever claim the
    /// same job.
    async fn claim_next_ready(
        &self,
        queue: &QueueName,
        concurrency_key: &str,
        max_concurrent: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, StorageError>;

    /// `Processing -> Succeeded`.
    async fn mark_succeeded(
        &self,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, StorageError>;

    /// `Processing -> Failed`, optionally scheduling a retry row at `retry_at`.
    ///
    /// With a retry, scheduled continuations of the failed row move to the
    /// retry row in the same atomic step.
    async fn mark_failed(
        &self,
        id: &JobId,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, StorageError>;

    /// Enqueue every scheduled job that is due and whose parent succeeded.
    async fn promote_scheduled_to_enqueued(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StorageError>;

    /// Enqueue the due scheduled children of a succeeded parent.
    async fn promote_continuations(
        &self,
        parent: &JobId,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StorageError>;

    /// `Processing -> Enqueued`, handing an unfinished attempt back.
    async fn requeue(&self, id: &JobId, now: DateTime<Utc>) -> Result<JobRecord, StorageError>;

    /// Refresh the heartbeat of a processing job.
    async fn heartbeat(&self, id: &JobId, now: DateTime<Utc>) -> Result<(), StorageError>;

    /// Requeue processing jobs whose last heartbeat is older than `stale_before`.
    async fn requeue_abandoned(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StorageError>;

    /// Cancel a scheduled, enqueued or failed job.
    async fn delete_job(&self, id: &JobId, now: DateTime<Utc>) -> Result<JobRecord, StorageError>;

    /// Count jobs per state.
    async fn count_by_state(&self) -> Result<StateCounts, StorageError>;

    // Recurring operations

    /// Insert or replace a recurring definition by key.
    ///
    /// When the stored definition has the same expression and timezone its
    /// `next_fire_at` is kept. `created_at` and the last-fire bookkeeping
    /// always survive.
    async fn upsert_recurring(
        &self,
        definition: RecurringDefinition,
    ) -> Result<RecurringDefinition, StorageError>;

    /// Get a recurring definition by key.
    async fn get_recurring(
        &self,
        key: &RecurringKey,
    ) -> Result<RecurringDefinition, StorageError>;

    /// List recurring definitions ordered by key.
    async fn list_recurring(&self) -> Result<Vec<RecurringDefinition>, StorageError>;

    /// Remove a recurring definition. Spawned jobs are kept.
    async fn remove_recurring(&self, key: &RecurringKey) -> Result<(), StorageError>;

    /// Definitions whose next occurrence is at or before `now`.
    async fn due_recurring(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecurringDefinition>, StorageError>;

    /// Fire one occurrence of a recurring definition.
    ///
    /// Atomically checks that `next_fire_at` still equals `expected_next`,
    /// creates `job` and moves `next_fire_at` to `new_next`. Returns `None`
    /// when the occurrence was already fired.
    async fn fire_recurring(
        &self,
        key: &RecurringKey,
        expected_next: DateTime<Utc>,
        new_next: DateTime<Utc>,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, StorageError>;
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn create(&self, job: NewJob, now: DateTime<Utc>) -> Result<JobRecord, StorageError> {
        (**self).create(job, now).await
    }

    async fn get_job(&self, id: &JobId) -> Result<JobRecord, StorageError> {
        (**self).get_job(id).await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StorageError> {
        (**self).list_jobs(filter).await
    }

    async fn claim_next_ready(
        &self,
        queue: &QueueName,
        concurrency_key: &str,
        max_concurrent: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, StorageError> {
        (**self)
            .claim_next_ready(queue, concurrency_key, max_concurrent, now)
            .await
    }

    async fn mark_succeeded(
        &self,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, StorageError> {
        (**self).mark_succeeded(id, now).await
    }

    async fn mark_failed(
        &self,
        id: &JobId,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, StorageError> {
        (**self).mark_failed(id, error, retry_at, now).await
    }

    async fn promote_scheduled_to_enqueued(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StorageError> {
        (**self).promote_scheduled_to_enqueued(now).await
    }

    async fn promote_continuations(
        &self,
        parent: &JobId,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StorageError> {
        (**self).promote_continuations(parent, now).await
    }

    async fn requeue(&self, id: &JobId, now: DateTime<Utc>) -> Result<JobRecord, StorageError> {
        (**self).requeue(id, now).await
    }

    async fn heartbeat(&self, id: &JobId, now: DateTime<Utc>) -> Result<(), StorageError> {
        (**self).heartbeat(id, now).await
    }

    async fn requeue_abandoned(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StorageError> {
        (**self).requeue_abandoned(stale_before, now).await
    }

    async fn delete_job(&self, id: &JobId, now: DateTime<Utc>) -> Result<JobRecord, StorageError> {
        (**self).delete_job(id, now).await
    }

    async fn count_by_state(&self) -> Result<StateCounts, StorageError> {
        (**self).count_by_state().await
    }

    async fn upsert_recurring(
        &self,
        definition: RecurringDefinition,
    ) -> Result<RecurringDefinition, StorageError> {
        (**self).upsert_recurring(definition).await
    }

    async fn get_recurring(
        &self,
        key: &RecurringKey,
    ) -> Result<RecurringDefinition, StorageError> {
        (**self).get_recurring(key).await
    }

    async fn list_recurring(&self) -> Result<Vec<RecurringDefinition>, StorageError> {
        (**self).list_recurring().await
    }

    async fn remove_recurring(&self, key: &RecurringKey) -> Result<(), StorageError> {
        (**self).remove_recurring(key).await
    }

    async fn due_recurring(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecurringDefinition>, StorageError> {
        (**self).due_recurring(now).await
    }

    async fn fire_recurring(
        &self,
        key: &RecurringKey,
        expected_next: DateTime<Utc>,
        new_next: DateTime<Utc>,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, StorageError> {
        (**self)
            .fire_recurring(key, expected_next, new_next, job, now)
            .await
    }
}
