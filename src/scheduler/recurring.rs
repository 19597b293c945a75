//! Recurring job registration and firing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock, watch};

use super::dispatcher::{MIN_POLL_WAIT, store_backoff};
use super::types::SchedulerState;
use crate::client::SubmitError;
use crate::core::handler::HandlerRegistry;
use crate::core::job::JobRecord;
use crate::core::recurring::RecurringDefinition;
use crate::core::schedule::Schedule;
use crate::core::types::{QueueName, RecurringKey};
use crate::events::{Event, EventBus};
use crate::storage::{JobStore, StorageError};

/// Attempts at firing a manual trigger before giving up on a racing tick.
const TRIGGER_ATTEMPTS: usize = 3;

/// A recurring job registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringJobRequest {
    pub key: RecurringKey,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub arguments: Value,
    pub schedule_expression: String,
    #[serde(default)]
    pub queue: Option<QueueName>,
    /// IANA timezone name, UTC when absent.
    #[serde(default)]
    pub timezone: Option<String>,
}

impl RecurringJobRequest {
    pub fn new(
        key: impl Into<RecurringKey>,
        job_type: impl Into<String>,
        schedule_expression: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            job_type: job_type.into(),
            arguments: Value::Null,
            schedule_expression: schedule_expression.into(),
            queue: None,
            timezone: None,
        }
    }

    pub fn with_arguments(mut self, arguments: Value) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_queue(mut self, queue: impl Into<QueueName>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }
}

/// Registers recurring definitions and fires their occurrences.
pub struct RecurringScheduler<S: JobStore> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    queues: Arc<[QueueName]>,
    event_bus: Arc<EventBus>,
    wake: Arc<Notify>,
}

impl<S: JobStore> Clone for RecurringScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            queues: Arc::clone(&self.queues),
            event_bus: Arc::clone(&self.event_bus),
            wake: Arc::clone(&self.wake),
        }
    }
}

impl<S: JobStore> RecurringScheduler<S> {
    pub fn new(store: Arc<S>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            store,
            registry,
            queues: Arc::from(vec![QueueName::default()]),
            event_bus: Arc::new(EventBus::new()),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn with_queues(mut self, queues: impl IntoIterator<Item = QueueName>) -> Self {
        self.queues = queues.into_iter().collect::<Vec<_>>().into();
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    /// Create or replace the definition registered under `request.key`.
    ///
    /// Registering the same schedule again keeps the pending occurrence.
    pub async fn add_or_update(
        &self,
        request: RecurringJobRequest,
    ) -> Result<RecurringDefinition, SubmitError> {
        if !self.registry.contains(&request.job_type) {
            return Err(SubmitError::validation(format!(
                "unknown job type '{}'",
                request.job_type
            )));
        }

        let queue = request.queue.unwrap_or_default();
        if !self.queues.contains(&queue) {
            return Err(SubmitError::validation(format!("unknown queue '{}'", queue)));
        }

        let timezone = request.timezone.unwrap_or_else(|| "UTC".to_string());
        let schedule = Schedule::with_timezone(request.schedule_expression.as_str(), &timezone)
            .map_err(|e| SubmitError::validation(e.to_string()))?;

        let now = Utc::now();
        let next_fire_at = schedule
            .next_after(now)
            .map_err(|e| SubmitError::validation(e.to_string()))?;

        let definition = RecurringDefinition {
            key: request.key,
            job_type: request.job_type,
            arguments: request.arguments,
            queue,
            schedule_expression: request.schedule_expression,
            timezone,
            next_fire_at,
            last_fired_at: None,
            last_job_id: None,
            created_at: now,
            updated_at: now,
        };

        let stored = self.store.upsert_recurring(definition).await?;
        tracing::info!(key = %stored.key, next_fire_at = %stored.next_fire_at, "Recurring job registered");
        Ok(stored)
    }

    /// Remove a definition. Jobs it already spawned are kept.
    pub async fn remove(&self, key: &RecurringKey) -> Result<(), SubmitError> {
        self.store.remove_recurring(key).await?;
        tracing::info!(key = %key, "Recurring job removed");
        Ok(())
    }

    pub async fn get(&self, key: &RecurringKey) -> Result<RecurringDefinition, SubmitError> {
        Ok(self.store.get_recurring(key).await?)
    }

    pub async fn list(&self) -> Result<Vec<RecurringDefinition>, SubmitError> {
        Ok(self.store.list_recurring().await?)
    }

    /// Fire an instance now without moving the schedule.
    pub async fn trigger(&self, key: &RecurringKey) -> Result<JobRecord, SubmitError> {
        for _ in 0..TRIGGER_ATTEMPTS {
            let definition = self.store.get_recurring(key).await?;
            let now = Utc::now();
            let fired = self
                .store
                .fire_recurring(
                    key,
                    definition.next_fire_at,
                    definition.next_fire_at,
                    definition.instance(),
                    now,
                )
                .await?;

            if let Some(job) = fired {
                self.announce(key, &job, Some(definition.next_fire_at)).await;
                self.wake.notify_one();
                return Ok(job);
            }
        }

        Err(StorageError::Other(format!("recurring job '{}' kept changing while triggering", key)).into())
    }

    /// Fire every definition that is due at `now`.
    ///
    /// Each due definition fires once, however many occurrences were missed,
    /// and its next occurrence moves strictly past `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, StorageError> {
        let mut fired = Vec::new();

        for definition in self.store.due_recurring(now).await? {
            let schedule = match definition.schedule() {
                Ok(schedule) => schedule,
                Err(e) => {
                    tracing::warn!(key = %definition.key, error = %e, "Invalid stored schedule");
                    continue;
                }
            };

            let new_next = match schedule.next_after(definition.next_fire_at.max(now)) {
                Ok(next) => next,
                Err(e) => {
                    tracing::warn!(key = %definition.key, error = %e, "No further occurrence");
                    continue;
                }
            };

            let result = self
                .store
                .fire_recurring(
                    &definition.key,
                    definition.next_fire_at,
                    new_next,
                    definition.instance(),
                    now,
                )
                .await?;

            match result {
                Some(job) => {
                    self.announce(&definition.key, &job, Some(new_next)).await;
                    fired.push(job);
                }
                None => {
                    tracing::debug!(key = %definition.key, "Occurrence already fired");
                }
            }
        }

        if !fired.is_empty() {
            self.wake.notify_one();
        }
        Ok(fired)
    }

    /// Tick every `period` until shutdown is signalled.
    pub(crate) async fn run(
        self,
        period: Duration,
        state: Arc<RwLock<SchedulerState>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let period = period.max(MIN_POLL_WAIT);
        let backoff = store_backoff();
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let mut wait = period;
            if *state.read().await == SchedulerState::Running {
                match self.tick(Utc::now()).await {
                    Ok(_) => failures = 0,
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        wait = backoff.delay_for(failures).min(period);
                        tracing::warn!(error = %e, failures, retry_in = ?wait, "Recurring tick failed");
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::debug!("Recurring scheduler stopped");
    }

    async fn announce(&self, key: &RecurringKey, job: &JobRecord, next: Option<DateTime<Utc>>) {
        self.event_bus
            .emit(Event::job_created(
                job.id.clone(),
                &job.job_type,
                job.queue.clone(),
                job.state,
            ))
            .await;
        self.event_bus
            .emit(Event::recurring_fired(key.clone(), job.id.clone(), next))
            .await;
    }
}
