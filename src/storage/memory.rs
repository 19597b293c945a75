//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{JobStore, StorageError};
use crate::core::job::{FailureOutcome, JobFilter, JobRecord, JobState, NewJob, StateCounts};
use crate::core::recurring::RecurringDefinition;
use crate::core::types::{JobId, QueueName, RecurringKey};

/// In-memory storage backend.
///
/// One RwLock guards jobs and recurring definitions together, so every
/// operation is atomic. Data is not persisted across restarts.
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

#[derive(Default)]
struct StoreState {
    jobs: HashMap<JobId, JobRecord>,
    recurring: BTreeMap<RecurringKey, RecurringDefinition>,
    next_sequence: i64,
}

impl StoreState {
    fn insert(&mut self, job: NewJob, now: DateTime<Utc>) -> Result<JobRecord, StorageError> {
        let parent_state = match &job.continuation_of {
            Some(parent) => Some(
                self.jobs
                    .get(parent)
                    .ok_or_else(|| StorageError::job_not_found(parent))?
                    .state,
            ),
            None => None,
        };
        let state = job.initial_state(parent_state, now);
        self.next_sequence += 1;
        let record = JobRecord::from_new(job, self.next_sequence, state, now);
        self.jobs.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    fn transition(
        &mut self,
        id: &JobId,
        from: &[JobState],
        to: JobState,
        now: DateTime<Utc>,
    ) -> Result<&mut JobRecord, StorageError> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StorageError::job_not_found(id))?;
        if !from.contains(&job.state) || !job.state.can_transition_to(to) {
            return Err(StorageError::InvalidTransition {
                id: id.clone(),
                from: job.state,
                to,
            });
        }
        job.state = to;
        job.updated_at = now;
        Ok(job)
    }

    fn parent_succeeded(&self, job: &JobRecord) -> bool {
        match &job.continuation_of {
            Some(parent) => self
                .jobs
                .get(parent)
                .is_some_and(|p| p.state == JobState::Succeeded),
            None => true,
        }
    }

    /// Enqueue the given scheduled jobs in insertion order.
    fn enqueue_all(
        &mut self,
        mut ids: Vec<(i64, JobId)>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StorageError> {
        ids.sort();
        let mut promoted = Vec::with_capacity(ids.len());
        for (_, id) in ids {
            self.transition(&id, &[JobState::Scheduled], JobState::Enqueued, now)?;
            promoted.push(id);
        }
        Ok(promoted)
    }
}

impl InMemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreState>, StorageError> {
        self.state
            .read()
            .map_err(|_| StorageError::Unavailable("storage lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreState>, StorageError> {
        self.state
            .write()
            .map_err(|_| StorageError::Unavailable("storage lock poisoned".into()))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn create(&self, job: NewJob, now: DateTime<Utc>) -> Result<JobRecord, StorageError> {
        self.write()?.insert(job, now)
    }

    async fn get_job(&self, id: &JobId) -> Result<JobRecord, StorageError> {
        self.read()?
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::job_not_found(id))
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StorageError> {
        let state = self.read()?;
        let mut result: Vec<_> = state
            .jobs
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        result.sort_by_key(|job| job.sequence);
        if let Some(limit) = filter.limit {
            result.truncate(limit);
        }
        Ok(result)
    }

    async fn claim_next_ready(
        &self,
        queue: &QueueName,
        concurrency_key: &str,
        max_concurrent: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, StorageError> {
        let mut state = self.write()?;
        let processing = state
            .jobs
            .values()
            .filter(|j| j.state == JobState::Processing && j.concurrency_key == concurrency_key)
            .count();
        if processing >= max_concurrent {
            return Ok(None);
        }

        let candidate = state
            .jobs
            .values()
            .filter(|j| {
                j.is_ready(now) && &j.queue == queue && j.concurrency_key == concurrency_key
            })
            .min_by_key(|j| (j.fire_at, j.sequence))
            .map(|j| j.id.clone());
        let Some(id) = candidate else {
            return Ok(None);
        };

        let job = state.transition(&id, &[JobState::Enqueued], JobState::Processing, now)?;
        job.claimed_at = Some(now);
        job.heartbeat_at = Some(now);
        Ok(Some(job.clone()))
    }

    async fn mark_succeeded(
        &self,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, StorageError> {
        let mut state = self.write()?;
        let job = state.transition(id, &[JobState::Processing], JobState::Succeeded, now)?;
        job.finished_at = Some(now);
        Ok(job.clone())
    }

    async fn mark_failed(
        &self,
        id: &JobId,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, StorageError> {
        let mut state = self.write()?;
        let failed = {
            let job = state.transition(id, &[JobState::Processing], JobState::Failed, now)?;
            job.last_error = Some(error.to_string());
            job.finished_at = Some(now);
            job.clone()
        };

        let Some(retry_at) = retry_at else {
            return Ok(FailureOutcome {
                failed,
                retry: None,
                moved_continuations: Vec::new(),
            });
        };

        let retry = state.insert(failed.next_attempt(retry_at), now)?;
        let mut moved: Vec<(i64, JobId)> = Vec::new();
        for job in state.jobs.values_mut() {
            if job.state == JobState::Scheduled && job.continuation_of.as_ref() == Some(&failed.id)
            {
                job.continuation_of = Some(retry.id.clone());
                job.updated_at = now;
                moved.push((job.sequence, job.id.clone()));
            }
        }
        moved.sort();

        Ok(FailureOutcome {
            failed,
            retry: Some(retry),
            moved_continuations: moved.into_iter().map(|(_, id)| id).collect(),
        })
    }

    async fn promote_scheduled_to_enqueued(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StorageError> {
        let mut state = self.write()?;
        let due: Vec<(i64, JobId)> = state
            .jobs
            .values()
            .filter(|j| j.state == JobState::Scheduled && j.fire_at <= now)
            .filter(|j| state.parent_succeeded(j))
            .map(|j| (j.sequence, j.id.clone()))
            .collect();
        state.enqueue_all(due, now)
    }

    async fn promote_continuations(
        &self,
        parent: &JobId,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StorageError> {
        let mut state = self.write()?;
        let parent_state = state
            .jobs
            .get(parent)
            .ok_or_else(|| StorageError::job_not_found(parent))?
            .state;
        if parent_state != JobState::Succeeded {
            return Ok(Vec::new());
        }

        let children: Vec<(i64, JobId)> = state
            .jobs
            .values()
            .filter(|j| {
                j.state == JobState::Scheduled
                    && j.continuation_of.as_ref() == Some(parent)
                    && j.fire_at <= now
            })
            .map(|j| (j.sequence, j.id.clone()))
            .collect();
        state.enqueue_all(children, now)
    }

    async fn requeue(&self, id: &JobId, now: DateTime<Utc>) -> Result<JobRecord, StorageError> {
        let mut state = self.write()?;
        let job = state.transition(id, &[JobState::Processing], JobState::Enqueued, now)?;
        job.claimed_at = None;
        job.heartbeat_at = None;
        Ok(job.clone())
    }

    async fn heartbeat(&self, id: &JobId, now: DateTime<Utc>) -> Result<(), StorageError> {
        let mut state = self.write()?;
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| StorageError::job_not_found(id))?;
        if job.state != JobState::Processing {
            return Err(StorageError::InvalidTransition {
                id: id.clone(),
                from: job.state,
                to: JobState::Processing,
            });
        }
        job.heartbeat_at = Some(now);
        Ok(())
    }

    async fn requeue_abandoned(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StorageError> {
        let mut state = self.write()?;
        let mut stale: Vec<(i64, JobId)> = state
            .jobs
            .values()
            .filter(|j| j.state == JobState::Processing)
            .filter(|j| j.heartbeat_at.or(j.claimed_at).unwrap_or(j.updated_at) < stale_before)
            .map(|j| (j.sequence, j.id.clone()))
            .collect();
        stale.sort();

        let mut requeued = Vec::with_capacity(stale.len());
        for (_, id) in stale {
            let job = state.transition(&id, &[JobState::Processing], JobState::Enqueued, now)?;
            job.claimed_at = None;
            job.heartbeat_at = None;
            requeued.push(id);
        }
        Ok(requeued)
    }

    async fn delete_job(&self, id: &JobId, now: DateTime<Utc>) -> Result<JobRecord, StorageError> {
        let mut state = self.write()?;
        let job = state.transition(
            id,
            &[JobState::Scheduled, JobState::Enqueued, JobState::Failed],
            JobState::Deleted,
            now,
        )?;
        job.finished_at = Some(now);
        Ok(job.clone())
    }

    async fn count_by_state(&self) -> Result<StateCounts, StorageError> {
        let state = self.read()?;
        let mut counts = StateCounts::default();
        for job in state.jobs.values() {
            counts.add(job.state, 1);
        }
        Ok(counts)
    }

    async fn upsert_recurring(
        &self,
        mut definition: RecurringDefinition,
    ) -> Result<RecurringDefinition, StorageError> {
        let mut state = self.write()?;
        if let Some(existing) = state.recurring.get(&definition.key) {
            if existing.same_schedule(&definition) {
                definition.next_fire_at = existing.next_fire_at;
            }
            definition.created_at = existing.created_at;
            definition.last_fired_at = existing.last_fired_at;
            definition.last_job_id = existing.last_job_id.clone();
        }
        state
            .recurring
            .insert(definition.key.clone(), definition.clone());
        Ok(definition)
    }

    async fn get_recurring(
        &self,
        key: &RecurringKey,
    ) -> Result<RecurringDefinition, StorageError> {
        self.read()?
            .recurring
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::recurring_not_found(key))
    }

    async fn list_recurring(&self) -> Result<Vec<RecurringDefinition>, StorageError> {
        Ok(self.read()?.recurring.values().cloned().collect())
    }

    async fn remove_recurring(&self, key: &RecurringKey) -> Result<(), StorageError> {
        self.write()?
            .recurring
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::recurring_not_found(key))
    }

    async fn due_recurring(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecurringDefinition>, StorageError> {
        Ok(self
            .read()?
            .recurring
            .values()
            .filter(|def| def.is_due(now))
            .cloned()
            .collect())
    }

    async fn fire_recurring(
        &self,
        key: &RecurringKey,
        expected_next: DateTime<Utc>,
        new_next: DateTime<Utc>,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, StorageError> {
        let mut state = self.write()?;
        let current = state
            .recurring
            .get(key)
            .ok_or_else(|| StorageError::recurring_not_found(key))?
            .next_fire_at;
        if current != expected_next {
            return Ok(None);
        }

        let record = state.insert(job, now)?;
        if let Some(def) = state.recurring.get_mut(key) {
            def.next_fire_at = new_next;
            def.last_fired_at = Some(now);
            def.last_job_id = Some(record.id.clone());
            def.updated_at = now;
        }
        Ok(Some(record))
    }
}
