//! Recurring job definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::job::NewJob;
use super::schedule::{Schedule, ScheduleError};
use super::types::{JobId, QueueName, RecurringKey};

/// A named schedule that spawns job instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringDefinition {
    pub key: RecurringKey,
    pub job_type: String,
    pub arguments: Value,
    pub queue: QueueName,
    pub schedule_expression: String,
    pub timezone: String,
    pub next_fire_at: DateTime<Utc>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub last_job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurringDefinition {
    /// Parse the stored recurrence rule.
    pub fn schedule(&self) -> Result<Schedule, ScheduleError> {
        Schedule::with_timezone(self.schedule_expression.as_str(), &self.timezone)
    }

    /// Whether the definition has an occurrence at or before `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_fire_at <= now
    }

    /// Whether `other` uses the same recurrence rule.
    pub fn same_schedule(&self, other: &RecurringDefinition) -> bool {
        self.schedule_expression == other.schedule_expression && self.timezone == other.timezone
    }

    /// Job request for one instance of this definition.
    pub fn instance(&self) -> NewJob {
        NewJob::new(self.job_type.clone(), self.arguments.clone())
            .with_queue(self.queue.clone())
            .with_recurring_key(self.key.clone())
    }
}
