//! API response types.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::core::job::{JobRecord, StateCounts};
use crate::core::recurring::RecurringDefinition;
use crate::scheduler::SchedulerState;

/// Convert a timestamp to milliseconds since Unix epoch.
fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "ok",
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

/// Scheduler state response.
#[derive(Debug, Serialize)]
pub struct SchedulerStateResponse {
    pub state: String,
    pub is_running: bool,
    pub is_paused: bool,
}

impl From<SchedulerState> for SchedulerStateResponse {
    fn from(state: SchedulerState) -> Self {
        Self {
            state: state.to_string(),
            is_running: state == SchedulerState::Running,
            is_paused: state == SchedulerState::Paused,
        }
    }
}

/// Acknowledgement of a submitted job.
#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    pub id: String,
    pub state: String,
}

impl From<&JobRecord> for CreatedResponse {
    fn from(job: &JobRecord) -> Self {
        Self {
            id: job.id.to_string(),
            state: job.state.to_string(),
        }
    }
}

/// Job details.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub arguments: Value,
    pub queue: String,
    pub state: String,
    pub fire_at: i64,
    pub continuation_of: Option<String>,
    pub recurring_key: Option<String>,
    pub attempt: u32,
    pub retry_of: Option<String>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

impl From<JobRecord> for JobResponse {
    fn from(job: JobRecord) -> Self {
        Self {
            id: job.id.to_string(),
            job_type: job.job_type,
            arguments: job.arguments,
            queue: job.queue.to_string(),
            state: job.state.to_string(),
            fire_at: to_millis(job.fire_at),
            continuation_of: job.continuation_of.map(|id| id.to_string()),
            recurring_key: job.recurring_key.map(|key| key.to_string()),
            attempt: job.attempt,
            retry_of: job.retry_of.map(|id| id.to_string()),
            last_error: job.last_error,
            created_at: to_millis(job.created_at),
            finished_at: job.finished_at.map(to_millis),
        }
    }
}

/// List of jobs response.
#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub count: usize,
}

/// Recurring definition details.
#[derive(Debug, Serialize)]
pub struct RecurringResponse {
    pub key: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub arguments: Value,
    pub queue: String,
    pub schedule_expression: String,
    pub timezone: String,
    pub next_fire_at: i64,
    pub last_fired_at: Option<i64>,
    pub last_job_id: Option<String>,
}

impl From<RecurringDefinition> for RecurringResponse {
    fn from(def: RecurringDefinition) -> Self {
        Self {
            key: def.key.to_string(),
            job_type: def.job_type,
            arguments: def.arguments,
            queue: def.queue.to_string(),
            schedule_expression: def.schedule_expression,
            timezone: def.timezone,
            next_fire_at: to_millis(def.next_fire_at),
            last_fired_at: def.last_fired_at.map(to_millis),
            last_job_id: def.last_job_id.map(|id| id.to_string()),
        }
    }
}

/// List of recurring definitions response.
#[derive(Debug, Serialize)]
pub struct RecurringListResponse {
    pub recurring: Vec<RecurringResponse>,
    pub count: usize,
}

/// Job counts by state.
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub counts: StateCounts,
    pub total: u64,
    pub recurring: usize,
}

/// Simple message response.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
