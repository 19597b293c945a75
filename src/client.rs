//! Job submission and queries.
//!
//! [`JobClient`] is the only way new jobs enter the system. It rejects
//! requests the scheduler could never run (unknown job types or queues,
//! unserializable arguments, unknown parents) before anything is stored.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;

use crate::core::handler::HandlerRegistry;
use crate::core::job::{JobFilter, JobRecord, NewJob, StateCounts};
use crate::core::types::{JobId, QueueName};
use crate::events::{Event, EventBus};
use crate::storage::{JobStore, StorageError};

/// Errors returned on the submission path.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The request can never be executed as given.
    #[error("validation error: {0}")]
    Validation(String),

    /// Storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SubmitError {
    pub fn validation(message: impl Into<String>) -> Self {
        SubmitError::Validation(message.into())
    }
}

/// A job submission as received from the outside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub queue: Option<QueueName>,
    /// Delay before the job becomes eligible.
    #[serde(default)]
    pub delay_secs: Option<u64>,
    /// Parent that must succeed first.
    #[serde(default)]
    pub continuation_of: Option<JobId>,
}

impl JobRequest {
    pub fn new(job_type: impl Into<String>, arguments: Value) -> Self {
        Self {
            job_type: job_type.into(),
            arguments,
            queue: None,
            delay_secs: None,
            continuation_of: None,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<QueueName>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_secs = Some(delay.as_secs());
        self
    }

    pub fn with_continuation_of(mut self, parent: JobId) -> Self {
        self.continuation_of = Some(parent);
        self
    }
}

/// Submits, cancels and queries jobs.
pub struct JobClient<S: JobStore> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    queues: Arc<[QueueName]>,
    event_bus: Arc<EventBus>,
    wake: Arc<Notify>,
}

impl<S: JobStore> Clone for JobClient<S> {
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

impl<S: JobStore> JobClient<S> {
    /// Create a client accepting the default queue only.
    pub fn new(store: Arc<S>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            store,
            registry,
            queues: Arc::from(vec![QueueName::default()]),
            event_bus: Arc::new(EventBus::new()),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Queues jobs may be submitted to.
    pub fn with_queues(mut self, queues: impl IntoIterator<Item = QueueName>) -> Self {
        self.queues = queues.into_iter().collect::<Vec<_>>().into();
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Signal notified after each successful submission.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn queues(&self) -> &[QueueName] {
        &self.queues
    }

    /// Run a job as soon as a worker is free.
    pub async fn enqueue<T: Serialize + ?Sized>(
        &self,
        job_type: &str,
        arguments: &T,
    ) -> Result<JobRecord, SubmitError> {
        self.create(JobRequest::new(job_type, to_arguments(arguments)?))
            .await
    }

    /// Run a job once `delay` has passed.
    pub async fn schedule<T: Serialize + ?Sized>(
        &self,
        job_type: &str,
        arguments: &T,
        delay: Duration,
    ) -> Result<JobRecord, SubmitError> {
        self.create(JobRequest::new(job_type, to_arguments(arguments)?).with_delay(delay))
            .await
    }

    /// Run a job after `parent` succeeds.
    pub async fn continue_with<T: Serialize + ?Sized>(
        &self,
        parent: &JobId,
        job_type: &str,
        arguments: &T,
    ) -> Result<JobRecord, SubmitError> {
        self.create(
            JobRequest::new(job_type, to_arguments(arguments)?)
                .with_continuation_of(parent.clone()),
        )
        .await
    }

    /// Validate and store a job request.
    pub async fn create(&self, request: JobRequest) -> Result<JobRecord, SubmitError> {
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

        let now = Utc::now();
        let mut job = NewJob::new(request.job_type, request.arguments).with_queue(queue);
        if let Some(secs) = request.delay_secs {
            let fire_at = i64::try_from(secs)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .and_then(|delay| now.checked_add_signed(delay))
                .ok_or_else(|| SubmitError::validation(format!("delay of {}s is too large", secs)))?;
            job = job.with_fire_at(fire_at);
        }
        let parent = request.continuation_of;
        if let Some(parent) = &parent {
            job = job.with_continuation_of(parent.clone());
        }

        let record = match self.store.create(job, now).await {
            Ok(record) => record,
            Err(StorageError::NotFound(_)) if parent.is_some() => {
                return Err(SubmitError::validation(format!(
                    "unknown parent job '{}'",
                    parent.map(|p| p.to_string()).unwrap_or_default()
                )));
            }
            Err(e) => return Err(e.into()),
        };

        self.event_bus
            .emit(Event::job_created(
                record.id.clone(),
                &record.job_type,
                record.queue.clone(),
                record.state,
            ))
            .await;
        self.wake.notify_one();

        Ok(record)
    }

    /// Cancel a job that has not started or has failed.
    pub async fn delete(&self, id: &JobId) -> Result<JobRecord, SubmitError> {
        Ok(self.store.delete_job(id, Utc::now()).await?)
    }

    pub async fn get(&self, id: &JobId) -> Result<JobRecord, SubmitError> {
        Ok(self.store.get_job(id).await?)
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, SubmitError> {
        Ok(self.store.list_jobs(filter).await?)
    }

    pub async fn counts(&self) -> Result<StateCounts, SubmitError> {
        Ok(self.store.count_by_state().await?)
    }
}

fn to_arguments<T: Serialize + ?Sized>(arguments: &T) -> Result<Value, SubmitError> {
    serde_json::to_value(arguments)
        .map_err(|e| SubmitError::validation(format!("arguments do not serialize: {}", e)))
}
