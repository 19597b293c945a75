//! Bounded worker pool that runs claimed jobs.
//!
//! The pool owns a fixed number of execution slots. Each submitted job runs
//! on its own task:
//! - Handler lookup (unknown types fail terminally)
//! - Named-lock acquisition for limited types (timeouts requeue the job)
//! - Handler execution on a nested task with a heartbeat
//! - Outcome recording, retries and continuation promotion

use chrono::Utc;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Notify, RwLock, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};

use super::guard::NamedLocks;
use crate::core::handler::{HandlerError, HandlerRegistry, JobContext, JobHandler};
use crate::core::job::JobRecord;
use crate::core::retry::RetryPolicy;
use crate::core::types::JobId;
use crate::events::{Event, EventBus, RequeueReason};
use crate::scheduler::ContinuationLinker;
use crate::storage::JobStore;

/// Lower bound for the heartbeat period.
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// How often shutdown checks whether in-flight jobs have finished.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors returned when handing a job to the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No slot freed up within the submit timeout.
    #[error("worker pool saturated: no slot within {0:?}")]
    Saturated(Duration),

    /// The pool is shutting down.
    #[error("worker pool is shut down")]
    Closed,
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Fixed-size pool of job executions.
pub struct WorkerPool<S: JobStore> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    locks: Arc<NamedLocks>,
    event_bus: Arc<EventBus>,
    retry_policy: RetryPolicy,
    slots: Arc<Semaphore>,
    size: usize,
    submit_timeout: Duration,
    heartbeat_interval: Duration,
    /// In-flight executions keyed by job id.
    running: Arc<RwLock<HashMap<JobId, JoinHandle<()>>>>,
    /// Notified whenever a slot frees up.
    wake: Arc<Notify>,
}

impl<S: JobStore + 'static> WorkerPool<S> {
    /// Create a pool with `size` slots (at least one).
    pub fn new(store: Arc<S>, registry: Arc<HandlerRegistry>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            store,
            registry,
            locks: Arc::new(NamedLocks::new()),
            event_bus: Arc::new(EventBus::new()),
            retry_policy: RetryPolicy::default(),
            slots: Arc::new(Semaphore::new(size)),
            size,
            submit_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            running: Arc::new(RwLock::new(HashMap::new())),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// How long `submit` waits for a free slot.
    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    /// Heartbeats are sent every third of the invisibility timeout.
    pub fn with_invisibility_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_interval = (timeout / 3).max(MIN_HEARTBEAT_INTERVAL);
        self
    }

    /// Share a wake-up signal with the dispatcher.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = wake;
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn locks(&self) -> &NamedLocks {
        &self.locks
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Number of jobs currently executing.
    pub async fn in_flight_count(&self) -> usize {
        let running = self.running.read().await;
        running.values().filter(|h| !h.is_finished()).count()
    }

    /// Hand a claimed job to the pool.
    ///
    /// Waits up to the submit timeout for a slot. The caller keeps ownership
    /// of the job on error and is expected to requeue it.
    pub async fn submit(self: &Arc<Self>, job: JobRecord) -> Result<(), PoolError> {
        let permit = match tokio::time::timeout(
            self.submit_timeout,
            Arc::clone(&self.slots).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => return Err(PoolError::Saturated(self.submit_timeout)),
        };

        let job_id = job.id.clone();
        let pool = Arc::clone(self);

        // Holding the write lock while spawning keeps the task from removing
        // itself before it is tracked.
        let mut running = self.running.write().await;
        let handle = tokio::spawn(async move {
            let id = job.id.clone();
            pool.execute(job).await;
            pool.running.write().await.remove(&id);
            drop(permit);
            pool.wake.notify_one();
        });
        running.insert(job_id, handle);

        Ok(())
    }

    async fn execute(&self, job: JobRecord) {
        let Some(registered) = self.registry.get(&job.job_type).cloned() else {
            let error = HandlerError::NotRegistered(job.job_type.clone());
            tracing::error!(job_id = %job.id, job_type = %job.job_type, "No handler registered");
            self.record_failure(&job, &error.to_string(), false).await;
            return;
        };

        let _guard = match registered.limit {
            Some(limit) => match self.locks.acquire(&job.concurrency_key, limit).await {
                Ok(guard) => Some(guard),
                Err(e) => {
                    tracing::info!(job_id = %job.id, error = %e, "Concurrency lock not acquired, requeueing");
                    self.requeue(&job, RequeueReason::LockTimeout).await;
                    return;
                }
            },
            None => None,
        };

        let started = Instant::now();
        match self.run_handler(registered.handler, &job).await {
            Ok(()) => self.record_success(&job, started.elapsed()).await,
            Err(e) => self.record_failure(&job, &e.to_string(), true).await,
        }
    }

    /// Run the handler on its own task, sending heartbeats until it returns.
    async fn run_handler(
        &self,
        handler: Arc<dyn JobHandler>,
        job: &JobRecord,
    ) -> Result<(), HandlerError> {
        let ctx = JobContext {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            queue: job.queue.clone(),
            attempt: job.attempt,
            arguments: job.arguments.clone(),
        };

        let mut task = tokio::spawn(async move { handler.execute(&ctx).await });
        let _abort = AbortOnDrop(task.abort_handle());

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                joined = &mut task => {
                    return match joined {
                        Ok(result) => result,
                        Err(e) if e.is_panic() => Err(HandlerError::Panicked(panic_message(e.into_panic()))),
                        Err(e) => Err(HandlerError::failed(format!("handler task cancelled: {}", e))),
                    };
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.store.heartbeat(&job.id, Utc::now()).await {
                        tracing::warn!(job_id = %job.id, error = %e, "Failed to record heartbeat");
                    }
                }
            }
        }
    }

    async fn record_success(&self, job: &JobRecord, duration: Duration) {
        if let Err(e) = self.store.mark_succeeded(&job.id, Utc::now()).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to mark job succeeded");
            return;
        }

        self.event_bus
            .emit(Event::job_succeeded(job.id.clone(), &job.job_type, duration))
            .await;

        let linker = ContinuationLinker::new(Arc::clone(&self.store), Arc::clone(&self.event_bus));
        if let Err(e) = linker.on_succeeded(&job.id).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to enqueue continuations");
        }
    }

    async fn record_failure(&self, job: &JobRecord, error: &str, retryable: bool) {
        let now = Utc::now();
        let retry_at = if retryable && self.retry_policy.should_retry(job.attempt) {
            chrono::Duration::from_std(self.retry_policy.delay_for(job.attempt))
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
        } else {
            None
        };

        match self.store.mark_failed(&job.id, error, retry_at, now).await {
            Ok(outcome) => {
                if !outcome.moved_continuations.is_empty() {
                    tracing::debug!(
                        job_id = %job.id,
                        count = outcome.moved_continuations.len(),
                        "Continuations moved to retry"
                    );
                }
                self.event_bus
                    .emit(Event::job_failed(
                        job.id.clone(),
                        &job.job_type,
                        job.attempt,
                        error,
                        outcome.retry.map(|retry| retry.id),
                    ))
                    .await;
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to mark job failed");
            }
        }
    }

    async fn requeue(&self, job: &JobRecord, reason: RequeueReason) {
        match self.store.requeue(&job.id, Utc::now()).await {
            Ok(_) => {
                self.event_bus
                    .emit(Event::job_requeued(job.id.clone(), reason))
                    .await;
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, reason = %reason, error = %e, "Failed to requeue job");
            }
        }
    }

    /// Stop accepting jobs and wait for in-flight ones.
    ///
    /// Jobs still running at the deadline are aborted and requeued. Returns
    /// the ids of the requeued jobs.
    pub async fn shutdown(&self, timeout: Duration) -> Vec<JobId> {
        self.slots.close();

        let running_count = self.in_flight_count().await;
        if running_count == 0 {
            tracing::info!("No running jobs to wait for during shutdown");
            return Vec::new();
        }

        tracing::info!(
            "Graceful shutdown: waiting for {} running job(s) to complete (timeout: {:?})",
            running_count,
            timeout
        );

        let start = tokio::time::Instant::now();
        let deadline = start + timeout;

        loop {
            let mut running = self.running.write().await;
            running.retain(|_, handle| !handle.is_finished());
            let remaining = running.len();
            drop(running);

            if remaining == 0 {
                tracing::info!("All running jobs completed gracefully in {:?}", start.elapsed());
                return Vec::new();
            }

            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    "Graceful shutdown timeout ({:?}) exceeded with {} job(s) still running",
                    timeout,
                    remaining
                );
                break;
            }

            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            tokio::time::sleep(SHUTDOWN_POLL_INTERVAL.min(left)).await;
        }

        let overrun: Vec<(JobId, JoinHandle<()>)> = self.running.write().await.drain().collect();
        let mut requeued = Vec::new();
        for (job_id, handle) in overrun {
            handle.abort();
            // Finished tasks have already recorded their outcome.
            if handle.await.is_ok() {
                continue;
            }
            match self.store.requeue(&job_id, Utc::now()).await {
                Ok(_) => {
                    self.event_bus
                        .emit(Event::job_requeued(job_id.clone(), RequeueReason::Shutdown))
                        .await;
                    requeued.push(job_id);
                }
                Err(e) => {
                    tracing::debug!(job_id = %job_id, error = %e, "Aborted job was not requeued");
                }
            }
        }
        requeued
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
