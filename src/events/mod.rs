//! Lifecycle events and event handling.
//!
//! The scheduler reports what happens to jobs through an [`EventBus`]. The
//! core does not log these itself; register a [`TracingHandler`] (or any other
//! [`EventHandler`]) to observe them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::core::job::JobState;
use crate::core::types::{JobId, QueueName, RecurringKey};

/// Why a processing job was handed back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueReason {
    /// The per-type concurrency lock was not acquired in time.
    LockTimeout,
    /// No worker slot freed up in time.
    PoolSaturated,
    /// The worker pool shut down before the job finished.
    Shutdown,
    /// The job stopped sending heartbeats.
    Abandoned,
}

impl RequeueReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequeueReason::LockTimeout => "lock_timeout",
            RequeueReason::PoolSaturated => "pool_saturated",
            RequeueReason::Shutdown => "shutdown",
            RequeueReason::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for RequeueReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle events emitted by the scheduler.
#[derive(Debug, Clone)]
pub enum Event {
    /// A job was stored.
    JobCreated {
        job_id: JobId,
        job_type: String,
        queue: QueueName,
        state: JobState,
        timestamp: Instant,
    },

    /// A worker claimed a job.
    JobClaimed {
        job_id: JobId,
        job_type: String,
        attempt: u32,
        timestamp: Instant,
    },

    /// A handler finished without error.
    JobSucceeded {
        job_id: JobId,
        job_type: String,
        duration: Duration,
        timestamp: Instant,
    },

    /// A handler failed.
    JobFailed {
        job_id: JobId,
        job_type: String,
        /// The attempt that failed (1-indexed).
        attempt: u32,
        error: String,
        /// The row scheduled for the next attempt, if any.
        retry_job_id: Option<JobId>,
        timestamp: Instant,
    },

    /// A processing job went back to the queue.
    JobRequeued {
        job_id: JobId,
        reason: RequeueReason,
        timestamp: Instant,
    },

    /// A continuation became ready after its parent succeeded.
    ContinuationEnqueued {
        job_id: JobId,
        parent_id: JobId,
        timestamp: Instant,
    },

    /// A recurring definition spawned a job.
    RecurringFired {
        key: RecurringKey,
        job_id: JobId,
        next_fire_at: Option<DateTime<Utc>>,
        timestamp: Instant,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::JobCreated { timestamp, .. } => *timestamp,
            Event::JobClaimed { timestamp, .. } => *timestamp,
            Event::JobSucceeded { timestamp, .. } => *timestamp,
            Event::JobFailed { timestamp, .. } => *timestamp,
            Event::JobRequeued { timestamp, .. } => *timestamp,
            Event::ContinuationEnqueued { timestamp, .. } => *timestamp,
            Event::RecurringFired { timestamp, .. } => *timestamp,
        }
    }

    /// The job the event is about.
    pub fn job_id(&self) -> &JobId {
        match self {
            Event::JobCreated { job_id, .. }
            | Event::JobClaimed { job_id, .. }
            | Event::JobSucceeded { job_id, .. }
            | Event::JobFailed { job_id, .. }
            | Event::JobRequeued { job_id, .. }
            | Event::ContinuationEnqueued { job_id, .. }
            | Event::RecurringFired { job_id, .. } => job_id,
        }
    }

    /// Snake-case event name.
    pub fn name(&self) -> &'static str {
        match self {
            Event::JobCreated { .. } => "job_created",
            Event::JobClaimed { .. } => "job_claimed",
            Event::JobSucceeded { .. } => "job_succeeded",
            Event::JobFailed { .. } => "job_failed",
            Event::JobRequeued { .. } => "job_requeued",
            Event::ContinuationEnqueued { .. } => "continuation_enqueued",
            Event::RecurringFired { .. } => "recurring_fired",
        }
    }

    pub fn job_created(
        job_id: JobId,
        job_type: impl Into<String>,
        queue: QueueName,
        state: JobState,
    ) -> Self {
        Event::JobCreated {
            job_id,
            job_type: job_type.into(),
            queue,
            state,
            timestamp: Instant::now(),
        }
    }

    pub fn job_claimed(job_id: JobId, job_type: impl Into<String>, attempt: u32) -> Self {
        Event::JobClaimed {
            job_id,
            job_type: job_type.into(),
            attempt,
            timestamp: Instant::now(),
        }
    }

    pub fn job_succeeded(job_id: JobId, job_type: impl Into<String>, duration: Duration) -> Self {
        Event::JobSucceeded {
            job_id,
            job_type: job_type.into(),
            duration,
            timestamp: Instant::now(),
        }
    }

    pub fn job_failed(
        job_id: JobId,
        job_type: impl Into<String>,
        attempt: u32,
        error: impl Into<String>,
        retry_job_id: Option<JobId>,
    ) -> Self {
        Event::JobFailed {
            job_id,
            job_type: job_type.into(),
            attempt,
            error: error.into(),
            retry_job_id,
            timestamp: Instant::now(),
        }
    }

    pub fn job_requeued(job_id: JobId, reason: RequeueReason) -> Self {
        Event::JobRequeued {
            job_id,
            reason,
            timestamp: Instant::now(),
        }
    }

    pub fn continuation_enqueued(job_id: JobId, parent_id: JobId) -> Self {
        Event::ContinuationEnqueued {
            job_id,
            parent_id,
            timestamp: Instant::now(),
        }
    }

    pub fn recurring_fired(
        key: RecurringKey,
        job_id: JobId,
        next_fire_at: Option<DateTime<Utc>>,
    ) -> Self {
        Event::RecurringFired {
            key,
            job_id,
            next_fire_at,
            timestamp: Instant::now(),
        }
    }
}

/// Handler for receiving lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHandler;

#[async_trait]
impl EventHandler for TracingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::JobCreated {
                job_id,
                job_type,
                queue,
                state,
                ..
            } => {
                tracing::info!(job_id = %job_id, job_type = %job_type, queue = %queue, state = %state, "Job created");
            }
            Event::JobClaimed {
                job_id,
                job_type,
                attempt,
                ..
            } => {
                tracing::debug!(job_id = %job_id, job_type = %job_type, attempt, "Job claimed");
            }
            Event::JobSucceeded {
                job_id,
                job_type,
                duration,
                ..
            } => {
                tracing::info!(job_id = %job_id, job_type = %job_type, duration_ms = duration.as_millis() as u64, "Job succeeded");
            }
            Event::JobFailed {
                job_id,
                job_type,
                attempt,
                error,
                retry_job_id,
                ..
            } => match retry_job_id {
                Some(retry) => {
                    tracing::warn!(job_id = %job_id, job_type = %job_type, attempt, error = %error, retry_job_id = %retry, "Job failed, retry scheduled");
                }
                None => {
                    tracing::error!(job_id = %job_id, job_type = %job_type, attempt, error = %error, "Job failed");
                }
            },
            Event::JobRequeued { job_id, reason, .. } => {
                tracing::info!(job_id = %job_id, reason = %reason, "Job requeued");
            }
            Event::ContinuationEnqueued {
                job_id, parent_id, ..
            } => {
                tracing::info!(job_id = %job_id, parent_id = %parent_id, "Continuation enqueued");
            }
            Event::RecurringFired {
                key,
                job_id,
                next_fire_at,
                ..
            } => {
                tracing::info!(key = %key, job_id = %job_id, next_fire_at = ?next_fire_at, "Recurring job fired");
            }
        }
    }
}
