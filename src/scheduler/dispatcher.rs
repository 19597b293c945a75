//! Dispatch loop: promotes due jobs and feeds claimed jobs to the worker pool.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock, watch};

use super::types::SchedulerState;
use crate::core::retry::RetryPolicy;
use crate::core::types::{JobId, QueueName};
use crate::events::{Event, EventBus, RequeueReason};
use crate::execution::{PoolError, WorkerPool};
use crate::storage::{JobStore, StorageError};

/// Shortest wait between passes.
pub(crate) const MIN_POLL_WAIT: Duration = Duration::from_millis(10);

/// Backoff applied by the scheduler loops while the store keeps failing.
pub(crate) fn store_backoff() -> RetryPolicy {
    RetryPolicy::exponential(u32::MAX, Duration::from_millis(100), Duration::from_secs(30))
}

/// One claim group: a queue and a concurrency key with its cap.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ClaimGroup {
    queue: QueueName,
    concurrency_key: String,
    max_concurrent: usize,
}

/// Moves jobs from the store into the worker pool.
pub struct Dispatcher<S: JobStore> {
    store: Arc<S>,
    pool: Arc<WorkerPool<S>>,
    event_bus: Arc<EventBus>,
    groups: Vec<ClaimGroup>,
    poll_interval: Duration,
    invisibility_timeout: Duration,
    recovery_interval: Duration,
    wake: Arc<Notify>,
}

impl<S: JobStore + 'static> Dispatcher<S> {
    /// Create a dispatcher for `queues`, one claim group per registered type.
    pub fn new(
        store: Arc<S>,
        pool: Arc<WorkerPool<S>>,
        queues: &[QueueName],
        wake: Arc<Notify>,
    ) -> Self {
        let registry = pool.registry();
        let mut groups = Vec::new();
        for queue in queues {
            for job_type in registry.job_types() {
                let max_concurrent = registry
                    .limit(&job_type)
                    .map(|limit| limit.max_concurrent)
                    .unwrap_or_else(|| pool.size());
                groups.push(ClaimGroup {
                    queue: queue.clone(),
                    concurrency_key: job_type,
                    max_concurrent,
                });
            }
        }

        Self {
            store,
            pool,
            event_bus: Arc::new(EventBus::new()),
            groups,
            poll_interval: Duration::from_secs(1),
            invisibility_timeout: Duration::from_secs(300),
            recovery_interval: Duration::from_secs(60),
            wake,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_invisibility_timeout(mut self, timeout: Duration) -> Self {
        self.invisibility_timeout = timeout;
        self
    }

    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    /// Run one dispatch pass.
    ///
    /// Promotes due jobs, then claims across all groups until a full cycle
    /// claims nothing or the pool has no free slot. Returns the number of
    /// jobs handed to the pool.
    pub async fn run_pass(&self) -> Result<usize, StorageError> {
        let promoted = self.store.promote_scheduled_to_enqueued(Utc::now()).await?;
        if !promoted.is_empty() {
            tracing::debug!(count = promoted.len(), "Promoted scheduled jobs");
        }

        let mut dispatched = 0;
        loop {
            let mut claimed_any = false;

            for group in &self.groups {
                if self.pool.available_slots() == 0 {
                    return Ok(dispatched);
                }

                let claimed = self
                    .store
                    .claim_next_ready(
                        &group.queue,
                        &group.concurrency_key,
                        group.max_concurrent,
                        Utc::now(),
                    )
                    .await?;
                let Some(job) = claimed else {
                    continue;
                };
                claimed_any = true;

                self.event_bus
                    .emit(Event::job_claimed(job.id.clone(), &job.job_type, job.attempt))
                    .await;

                let job_id = job.id.clone();
                match self.pool.submit(job).await {
                    Ok(()) => dispatched += 1,
                    Err(e) => {
                        tracing::warn!(job_id = %job_id, error = %e, "Worker pool rejected job, requeueing");
                        let reason = match e {
                            PoolError::Saturated(_) => RequeueReason::PoolSaturated,
                            PoolError::Closed => RequeueReason::Shutdown,
                        };
                        self.requeue(&job_id, reason).await?;
                        if matches!(e, PoolError::Closed) {
                            return Ok(dispatched);
                        }
                    }
                }
            }

            if !claimed_any {
                return Ok(dispatched);
            }
        }
    }

    async fn requeue(&self, job_id: &JobId, reason: RequeueReason) -> Result<(), StorageError> {
        self.store.requeue(job_id, Utc::now()).await?;
        self.event_bus
            .emit(Event::job_requeued(job_id.clone(), reason))
            .await;
        Ok(())
    }

    /// Requeue processing jobs that stopped sending heartbeats.
    pub async fn recover_abandoned(&self) -> Result<Vec<JobId>, StorageError> {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.invisibility_timeout)
            .unwrap_or(chrono::Duration::MAX);
        let stale_before = now.checked_sub_signed(timeout).unwrap_or(now);

        let requeued = self.store.requeue_abandoned(stale_before, now).await?;
        for job_id in &requeued {
            tracing::warn!(job_id = %job_id, "Recovered abandoned job");
            self.event_bus
                .emit(Event::job_requeued(job_id.clone(), RequeueReason::Abandoned))
                .await;
        }
        Ok(requeued)
    }

    /// Dispatch until shutdown is signalled.
    pub(crate) async fn run(
        self,
        state: Arc<RwLock<SchedulerState>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let backoff = store_backoff();
        let mut failures: u32 = 0;
        let mut last_recovery = tokio::time::Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let mut wait = self.poll_interval.max(MIN_POLL_WAIT);

            if *state.read().await == SchedulerState::Running {
                if last_recovery.elapsed() >= self.recovery_interval {
                    last_recovery = tokio::time::Instant::now();
                    if let Err(e) = self.recover_abandoned().await {
                        tracing::warn!(error = %e, "Abandoned job recovery failed");
                    }
                }

                match self.run_pass().await {
                    Ok(_) => failures = 0,
                    Err(StorageError::InvalidTransition { id, from, to }) => {
                        tracing::debug!(job_id = %id, from = %from, to = %to, "Lost a transition race, retrying next pass");
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        wait = backoff.delay_for(failures);
                        tracing::warn!(error = %e, failures, retry_in = ?wait, "Dispatch pass failed");
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.wake.notified(), if failures == 0 => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::debug!("Dispatcher stopped");
    }
}
