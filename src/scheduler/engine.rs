//! Scheduler engine implementation.
//!
//! The scheduler is responsible for:
//! - Recovering jobs abandoned by a previous process
//! - Running the dispatch loop and the recurring tick loop
//! - Pause and resume functionality
//! - Graceful shutdown of the worker pool

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock, mpsc, watch};
use tokio::task::JoinHandle;

use super::dispatcher::Dispatcher;
use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::recurring::RecurringScheduler;
use super::types::{SchedulerCommand, SchedulerError, SchedulerState};
use crate::client::JobClient;
use crate::core::handler::HandlerRegistry;
use crate::core::retry::RetryPolicy;
use crate::core::types::{JobId, QueueName};
use crate::events::{Event, EventBus, RequeueReason};
use crate::execution::WorkerPool;
use crate::storage::JobStore;

/// Main scheduler for job execution.
pub struct Scheduler<S: JobStore> {
    /// Storage backend.
    store: Arc<S>,
    /// Handlers by job type.
    registry: Arc<HandlerRegistry>,
    /// Event bus for emitting events.
    event_bus: Arc<EventBus>,
    /// Queues served by the dispatcher.
    queues: Vec<QueueName>,
    /// Worker pool size.
    workers: usize,
    /// Wait between dispatch passes.
    poll_interval: Duration,
    /// How long the dispatcher waits for a free worker slot.
    submit_timeout: Duration,
    /// Period of the recurring loop.
    recurring_tick: Duration,
    /// Processing jobs without a heartbeat for this long are requeued.
    invisibility_timeout: Duration,
    /// How often abandoned jobs are looked for.
    recovery_interval: Duration,
    /// Graceful shutdown timeout (default: 30 seconds).
    shutdown_timeout: Duration,
    retry_policy: RetryPolicy,
    /// Wakes the dispatcher on submission and when a slot frees.
    wake: Arc<Notify>,
}

impl<S: JobStore + 'static> Scheduler<S> {
    /// Create a new scheduler with the given storage.
    pub fn new(store: S, registry: HandlerRegistry) -> Self {
        Self::with_storage(Arc::new(store), registry)
    }

    /// Create a new scheduler with shared storage.
    pub fn with_storage(store: Arc<S>, registry: HandlerRegistry) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            event_bus: Arc::new(EventBus::new()),
            queues: vec![QueueName::default()],
            workers: 4,
            poll_interval: Duration::from_secs(1),
            submit_timeout: Duration::from_secs(5),
            recurring_tick: Duration::from_secs(15),
            invisibility_timeout: Duration::from_secs(300),
            recovery_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Arc::new(event_bus);
        self
    }

    /// Set the queues to dispatch from.
    pub fn with_queues(mut self, queues: impl IntoIterator<Item = QueueName>) -> Self {
        self.queues = queues.into_iter().collect();
        self
    }

    /// Set the number of worker slots.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the poll interval. Zero dispatches on wake-ups only.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    /// Set the recurring tick period.
    pub fn with_recurring_tick(mut self, tick: Duration) -> Self {
        self.recurring_tick = tick;
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

    /// Set the graceful shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// A submission client that wakes this scheduler's dispatcher.
    pub fn client(&self) -> JobClient<S> {
        JobClient::new(Arc::clone(&self.store), Arc::clone(&self.registry))
            .with_queues(self.queues.iter().cloned())
            .with_event_bus(Arc::clone(&self.event_bus))
            .with_wake(Arc::clone(&self.wake))
    }

    /// The recurring scheduler used by the tick loop.
    pub fn recurring(&self) -> RecurringScheduler<S> {
        RecurringScheduler::new(Arc::clone(&self.store), Arc::clone(&self.registry))
            .with_queues(self.queues.iter().cloned())
            .with_event_bus(Arc::clone(&self.event_bus))
            .with_wake(Arc::clone(&self.wake))
    }

    /// Requeue jobs a previous process left processing.
    ///
    /// Only jobs whose heartbeat is older than the invisibility timeout are
    /// touched, so jobs of another live worker sharing the store are left alone.
    pub async fn recover(&self) -> Result<Vec<JobId>, SchedulerError> {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.invisibility_timeout)
            .unwrap_or(chrono::Duration::MAX);
        let stale_before = now.checked_sub_signed(timeout).unwrap_or(now);

        let recovered = self.store.requeue_abandoned(stale_before, now).await?;
        for job_id in &recovered {
            tracing::warn!(job_id = %job_id, "Recovered interrupted job");
            self.event_bus
                .emit(Event::job_requeued(job_id.clone(), RequeueReason::Abandoned))
                .await;
        }
        Ok(recovered)
    }

    /// Start the scheduler and return a handle for controlling it.
    pub async fn start(self) -> (SchedulerHandle, JoinHandle<()>) {
        match self.recover().await {
            Ok(recovered) if !recovered.is_empty() => {
                tracing::info!(count = recovered.len(), "Requeued interrupted jobs");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Startup recovery failed"),
        }

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&state),
            wake: Arc::clone(&self.wake),
        };

        let scheduler_task = tokio::spawn(async move {
            self.run(command_rx, state).await;
        });

        (handle, scheduler_task)
    }

    /// Main scheduler loop.
    async fn run(
        self,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        state: Arc<RwLock<SchedulerState>>,
    ) {
        let pool = Arc::new(
            WorkerPool::new(
                Arc::clone(&self.store),
                Arc::clone(&self.registry),
                self.workers,
            )
            .with_event_bus(Arc::clone(&self.event_bus))
            .with_retry_policy(self.retry_policy.clone())
            .with_submit_timeout(self.submit_timeout)
            .with_invisibility_timeout(self.invisibility_timeout)
            .with_wake(Arc::clone(&self.wake)),
        );

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.store),
            Arc::clone(&pool),
            &self.queues,
            Arc::clone(&self.wake),
        )
        .with_event_bus(Arc::clone(&self.event_bus))
        .with_poll_interval(self.poll_interval)
        .with_invisibility_timeout(self.invisibility_timeout)
        .with_recovery_interval(self.recovery_interval);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatch_task = tokio::spawn(dispatcher.run(Arc::clone(&state), shutdown_rx.clone()));
        let recurring_task = tokio::spawn(self.recurring().run(
            self.recurring_tick,
            Arc::clone(&state),
            shutdown_rx,
        ));

        tracing::info!(
            workers = self.workers,
            queues = self.queues.len(),
            job_types = self.registry.len(),
            "Scheduler started"
        );

        loop {
            let command = command_rx.recv().await;
            match command {
                Some(SchedulerCommand::Pause { response }) => {
                    let mut s = state.write().await;
                    *s = SchedulerState::Paused;
                    tracing::info!("Scheduler paused");
                    let _ = response.send(());
                }
                Some(SchedulerCommand::Resume { response }) => {
                    let mut s = state.write().await;
                    *s = SchedulerState::Running;
                    drop(s);
                    self.wake.notify_one();
                    tracing::info!("Scheduler resumed");
                    let _ = response.send(());
                }
                Some(SchedulerCommand::Shutdown { response }) => {
                    self.stop(&state, &shutdown_tx, &pool, dispatch_task, recurring_task)
                        .await;
                    let _ = response.send(());
                    break;
                }
                None => {
                    // Every handle was dropped.
                    self.stop(&state, &shutdown_tx, &pool, dispatch_task, recurring_task)
                        .await;
                    break;
                }
            }
        }
    }

    async fn stop(
        &self,
        state: &RwLock<SchedulerState>,
        shutdown_tx: &watch::Sender<bool>,
        pool: &WorkerPool<S>,
        dispatch_task: JoinHandle<()>,
        recurring_task: JoinHandle<()>,
    ) {
        let mut s = state.write().await;
        *s = SchedulerState::Stopped;
        drop(s); // Release the lock before waiting

        let _ = shutdown_tx.send(true);
        if let Err(e) = dispatch_task.await {
            tracing::warn!(error = %e, "Dispatcher task ended abnormally");
        }
        if let Err(e) = recurring_task.await {
            tracing::warn!(error = %e, "Recurring task ended abnormally");
        }

        let requeued = pool.shutdown(self.shutdown_timeout).await;
        if !requeued.is_empty() {
            tracing::warn!(count = requeued.len(), "Requeued jobs still running at shutdown");
        }
        tracing::info!("Scheduler stopped");
    }
}
