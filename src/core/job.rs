//! Job records and their lifecycle.
//!
//! A job is one unit of deferred work: a handler type, a JSON payload, a queue
//! and a state. Retries are separate rows linked through `retry_of`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::types::{JobId, QueueName, RecurringKey};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its fire time or for its parent to succeed.
    Scheduled,
    /// Ready to be claimed by a worker.
    Enqueued,
    /// Claimed and executing.
    Processing,
    /// Handler finished without error.
    Succeeded,
    /// Handler returned an error or panicked.
    Failed,
    /// Cancelled before it ran.
    Deleted,
}

/// A state string that does not name any [`JobState`].
#[derive(Debug, Error)]
#[error("unknown job state: {0}")]
pub struct ParseJobStateError(String);

impl JobState {
    /// Every state, in lifecycle order.
    pub const ALL: [JobState; 6] = [
        JobState::Scheduled,
        JobState::Enqueued,
        JobState::Processing,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Deleted,
    ];

    /// Storage and wire name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Enqueued => "enqueued",
            JobState::Processing => "processing",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Deleted => "deleted",
        }
    }

    /// Whether `self -> next` is one of the allowed transitions.
    ///
    /// `Processing -> Enqueued` is the requeue of an unfinished attempt.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Scheduled, Enqueued)
                | (Enqueued, Processing)
                | (Processing, Succeeded)
                | (Processing, Failed)
                | (Processing, Enqueued)
                | (Scheduled, Deleted)
                | (Enqueued, Deleted)
                | (Failed, Deleted)
        )
    }

    /// Whether the job will never run again.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Deleted
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = ParseJobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseJobStateError(s.to_string()))
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: String,
    pub arguments: Value,
    pub queue: QueueName,
    pub state: JobState,
    /// Earliest time the job may be dispatched.
    pub fire_at: DateTime<Utc>,
    /// Parent that must succeed before this job is enqueued.
    pub continuation_of: Option<JobId>,
    /// Recurring definition that spawned this job.
    pub recurring_key: Option<RecurringKey>,
    /// Jobs sharing a key count against the same concurrency limit.
    pub concurrency_key: String,
    /// 1-based attempt number of this row.
    pub attempt: u32,
    /// First row of the retry chain this row belongs to.
    pub retry_of: Option<JobId>,
    pub last_error: Option<String>,
    /// Insertion order, breaks ties between equal fire times.
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Build the row for a new job.
    pub fn from_new(new: NewJob, sequence: i64, state: JobState, now: DateTime<Utc>) -> Self {
        let concurrency_key = new.concurrency_key().to_string();
        Self {
            id: JobId::new(),
            job_type: new.job_type,
            arguments: new.arguments,
            queue: new.queue,
            state,
            fire_at: new.fire_at.unwrap_or(now),
            continuation_of: new.continuation_of,
            recurring_key: new.recurring_key,
            concurrency_key,
            attempt: new.attempt,
            retry_of: new.retry_of,
            last_error: None,
            sequence,
            created_at: now,
            updated_at: now,
            claimed_at: None,
            heartbeat_at: None,
            finished_at: None,
        }
    }

    /// Request for the next attempt of this job, firing at `retry_at`.
    pub fn next_attempt(&self, retry_at: DateTime<Utc>) -> NewJob {
        NewJob {
            job_type: self.job_type.clone(),
            arguments: self.arguments.clone(),
            queue: self.queue.clone(),
            fire_at: Some(retry_at),
            continuation_of: self.continuation_of.clone(),
            recurring_key: self.recurring_key.clone(),
            concurrency_key: Some(self.concurrency_key.clone()),
            attempt: self.attempt.saturating_add(1),
            retry_of: Some(self.retry_of.clone().unwrap_or_else(|| self.id.clone())),
        }
    }

    /// Whether the job may be claimed at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Enqueued && self.fire_at <= now
    }
}

/// A request to create a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub job_type: String,
    pub arguments: Value,
    pub queue: QueueName,
    /// `None` fires at creation time.
    pub fire_at: Option<DateTime<Utc>>,
    pub continuation_of: Option<JobId>,
    pub recurring_key: Option<RecurringKey>,
    /// Defaults to the job type.
    pub concurrency_key: Option<String>,
    pub attempt: u32,
    pub retry_of: Option<JobId>,
}

impl NewJob {
    /// Create a fire-now job on the default queue.
    pub fn new(job_type: impl Into<String>, arguments: Value) -> Self {
        Self {
            job_type: job_type.into(),
            arguments,
            queue: QueueName::default(),
            fire_at: None,
            continuation_of: None,
            recurring_key: None,
            concurrency_key: None,
            attempt: 1,
            retry_of: None,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<QueueName>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_fire_at(mut self, fire_at: DateTime<Utc>) -> Self {
        self.fire_at = Some(fire_at);
        self
    }

    pub fn with_continuation_of(mut self, parent: JobId) -> Self {
        self.continuation_of = Some(parent);
        self
    }

    pub fn with_recurring_key(mut self, key: RecurringKey) -> Self {
        self.recurring_key = Some(key);
        self
    }

    pub fn with_concurrency_key(mut self, key: impl Into<String>) -> Self {
        self.concurrency_key = Some(key.into());
        self
    }

    /// The concurrency key the job will be stored with.
    pub fn concurrency_key(&self) -> &str {
        self.concurrency_key.as_deref().unwrap_or(&self.job_type)
    }

    /// State the job starts in, given the parent's current state.
    ///
    /// A job is enqueued right away only when its fire time has passed and
    /// its parent, if any, has already succeeded.
    pub fn initial_state(&self, parent: Option<JobState>, now: DateTime<Utc>) -> JobState {
        let due = self.fire_at.is_none_or(|at| at <= now);
        let parent_done = parent.is_none_or(|state| state == JobState::Succeeded);
        if due && parent_done {
            JobState::Enqueued
        } else {
            JobState::Scheduled
        }
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub queue: Option<QueueName>,
    pub job_type: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_queue(mut self, queue: impl Into<QueueName>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a record passes the filter (ignores `limit`).
    pub fn matches(&self, job: &JobRecord) -> bool {
        self.state.is_none_or(|state| job.state == state)
            && self.queue.as_ref().is_none_or(|queue| &job.queue == queue)
            && self
                .job_type
                .as_deref()
                .is_none_or(|job_type| job.job_type == job_type)
    }
}

/// Number of jobs in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub scheduled: u64,
    pub enqueued: u64,
    pub processing: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub deleted: u64,
}

impl StateCounts {
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Scheduled => self.scheduled,
            JobState::Enqueued => self.enqueued,
            JobState::Processing => self.processing,
            JobState::Succeeded => self.succeeded,
            JobState::Failed => self.failed,
            JobState::Deleted => self.deleted,
        }
    }

    pub fn add(&mut self, state: JobState, count: u64) {
        let slot = match state {
            JobState::Scheduled => &mut self.scheduled,
            JobState::Enqueued => &mut self.enqueued,
            JobState::Processing => &mut self.processing,
            JobState::Succeeded => &mut self.succeeded,
            JobState::Failed => &mut self.failed,
            JobState::Deleted => &mut self.deleted,
        };
        *slot += count;
    }

    pub fn total(&self) -> u64 {
        JobState::ALL.iter().map(|state| self.get(*state)).sum()
    }
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone)]
pub struct FailureOutcome {
    /// The row that failed, now `Failed`.
    pub failed: JobRecord,
    /// The scheduled retry row, when a retry was requested.
    pub retry: Option<JobRecord>,
    /// Continuations re-pointed from the failed row to the retry row.
    pub moved_continuations: Vec<JobId>,
}
