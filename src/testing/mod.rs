//! Testing utilities for users of the stint library.
//!
//! This module provides helpers for testing job handlers and the scheduler:
//!
//! - [`RecordingHandler`]: Records every execution and tracks overlap
//! - [`FailingHandler`]: A handler that fails N times then succeeds
//! - [`GatedHandler`]: A handler that blocks until the test opens its gate
//! - [`FlakyStore`]: A store wrapper that can be switched to unavailable
//! - [`wait_for_state`]: Polls the store until a job reaches a state

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::core::handler::{HandlerError, JobContext, JobHandler};
use crate::core::job::{FailureOutcome, JobFilter, JobRecord, JobState, NewJob, StateCounts};
use crate::core::recurring::RecurringDefinition;
use crate::core::types::{JobId, QueueName, RecurringKey};
use crate::storage::{JobStore, StorageError};

/// How often [`wait_for_state`] polls the store.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Poll `store` until job `id` is in `state`.
///
/// Returns the record once it gets there, or `None` after `timeout`.
pub async fn wait_for_state<S: JobStore + ?Sized>(
    store: &S,
    id: &JobId,
    state: JobState,
    timeout: Duration,
) -> Option<JobRecord> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match store.get_job(id).await {
            Ok(job) if job.state == state => return Some(job),
            _ => {}
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// A handler that records each execution.
///
/// Tracks how many executions overlapped, which makes it suitable for
/// checking concurrency limits.
///
/// # Example
///
/// ```
/// use stint::testing::RecordingHandler;
/// use std::time::Duration;
///
/// let handler = RecordingHandler::new().with_delay(Duration::from_millis(10));
/// assert_eq!(handler.call_count(), 0);
/// ```
#[derive(Debug, Default)]
pub struct RecordingHandler {
    delay: Duration,
    calls: Mutex<Vec<JobContext>>,
    spans: Mutex<Vec<(Instant, Instant)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every execution.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Contexts of all executions, in start order.
    pub fn calls(&self) -> Vec<JobContext> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Start and end instants of finished executions, in finish order.
    pub fn spans(&self) -> Vec<(Instant, Instant)> {
        lock(&self.spans).clone()
    }

    /// Highest number of executions that ran at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for RecordingHandler {
    async fn execute(&self, ctx: &JobContext) -> Result<(), HandlerError> {
        let started = Instant::now();
        lock(&self.calls).push(ctx.clone());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        lock(&self.spans).push((started, Instant::now()));
        Ok(())
    }
}

/// A handler that fails a configurable number of times before succeeding.
///
/// Useful for testing retry logic and error handling.
///
/// # Example
///
/// ```
/// use stint::testing::FailingHandler;
///
/// // Fails 2 times, then succeeds on the 3rd attempt
/// let handler = FailingHandler::new(2);
/// assert_eq!(handler.failures_remaining(), 2);
/// ```
#[derive(Debug)]
pub struct FailingHandler {
    state: Mutex<FailingHandlerState>,
    error_message: String,
}

#[derive(Debug)]
struct FailingHandlerState {
    failures_remaining: u32,
    call_count: u32,
}

impl FailingHandler {
    /// Create a handler that fails `fail_count` times then succeeds.
    pub fn new(fail_count: u32) -> Self {
        Self::with_error(fail_count, "intentional test failure")
    }

    /// Create a handler that fails with a custom error message.
    pub fn with_error(fail_count: u32, message: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(FailingHandlerState {
                failures_remaining: fail_count,
                call_count: 0,
            }),
            error_message: message.into(),
        }
    }

    pub fn failures_remaining(&self) -> u32 {
        lock(&self.state).failures_remaining
    }

    pub fn call_count(&self) -> u32 {
        lock(&self.state).call_count
    }
}

#[async_trait]
impl JobHandler for FailingHandler {
    async fn execute(&self, _ctx: &JobContext) -> Result<(), HandlerError> {
        let mut state = lock(&self.state);
        state.call_count += 1;

        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            Err(HandlerError::failed(self.error_message.clone()))
        } else {
            Ok(())
        }
    }
}

/// A handler that blocks every execution until [`GatedHandler::open`] is called.
#[derive(Debug)]
pub struct GatedHandler {
    gate: watch::Sender<bool>,
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl GatedHandler {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            gate,
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    /// Let current and future executions complete.
    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` executions have started.
    pub async fn wait_started(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.started() < count {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        true
    }
}

impl Default for GatedHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobHandler for GatedHandler {
    async fn execute(&self, _ctx: &JobContext) -> Result<(), HandlerError> {
        let mut gate = self.gate.subscribe();
        self.started.fetch_add(1, Ordering::SeqCst);
        gate.wait_for(|open| *open)
            .await
            .map_err(|e| HandlerError::failed(format!("gate closed: {}", e)))?;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Store wrapper that fails every call while marked unavailable.
///
/// # Example
///
/// ```
/// use stint::testing::FlakyStore;
/// use stint::InMemoryStore;
///
/// let store = FlakyStore::new(InMemoryStore::new());
/// store.set_unavailable(true);
/// assert!(store.is_unavailable());
/// ```
#[derive(Debug)]
pub struct FlakyStore<S> {
    inner: S,
    unavailable: AtomicBool,
    rejected: AtomicUsize,
}

impl<S: JobStore> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            unavailable: AtomicBool::new(false),
            rejected: AtomicUsize::new(0),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::SeqCst)
    }

    /// Number of calls rejected so far.
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.is_unavailable() {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Unavailable("simulated outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl<S: JobStore> JobStore for FlakyStore<S> {
    async fn create(&self, job: NewJob, now: DateTime<Utc>) -> Result<JobRecord, StorageError> {
        self.check()?;
        self.inner.create(job, now).await
    }

    async fn get_job(&self, id: &JobId) -> Result<JobRecord, StorageError> {
        self.check()?;
        self.inner.get_job(id).await
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StorageError> {
        self.check()?;
        self.inner.list_jobs(filter).await
    }

    async fn claim_next_ready(
        &self,
        queue: &QueueName,
        concurrency_key: &str,
        max_concurrent: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, StorageError> {
        self.check()?;
        self.inner
            .claim_next_ready(queue, concurrency_key, max_concurrent, now)
            .await
    }

    async fn mark_succeeded(
        &self,
        id: &JobId,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, StorageError> {
        self.check()?;
        self.inner.mark_succeeded(id, now).await
    }

    async fn mark_failed(
        &self,
        id: &JobId,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, StorageError> {
        self.check()?;
        self.inner.mark_failed(id, error, retry_at, now).await
    }

    async fn promote_scheduled_to_enqueued(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StorageError> {
        self.check()?;
        self.inner.promote_scheduled_to_enqueued(now).await
    }

    async fn promote_continuations(
        &self,
        parent: &JobId,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StorageError> {
        self.check()?;
        self.inner.promote_continuations(parent, now).await
    }

    async fn requeue(&self, id: &JobId, now: DateTime<Utc>) -> Result<JobRecord, StorageError> {
        self.check()?;
        self.inner.requeue(id, now).await
    }

    async fn heartbeat(&self, id: &JobId, now: DateTime<Utc>) -> Result<(), StorageError> {
        self.check()?;
        self.inner.heartbeat(id, now).await
    }

    async fn requeue_abandoned(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, StorageError> {
        self.check()?;
        self.inner.requeue_abandoned(stale_before, now).await
    }

    async fn delete_job(&self, id: &JobId, now: DateTime<Utc>) -> Result<JobRecord, StorageError> {
        self.check()?;
        self.inner.delete_job(id, now).await
    }

    async fn count_by_state(&self) -> Result<StateCounts, StorageError> {
        self.check()?;
        self.inner.count_by_state().await
    }

    async fn upsert_recurring(
        &self,
        definition: RecurringDefinition,
    ) -> Result<RecurringDefinition, StorageError> {
        self.check()?;
        self.inner.upsert_recurring(definition).await
    }

    async fn get_recurring(
        &self,
        key: &RecurringKey,
    ) -> Result<RecurringDefinition, StorageError> {
        self.check()?;
        self.inner.get_recurring(key).await
    }

    async fn list_recurring(&self) -> Result<Vec<RecurringDefinition>, StorageError> {
        self.check()?;
        self.inner.list_recurring().await
    }

    async fn remove_recurring(&self, key: &RecurringKey) -> Result<(), StorageError> {
        self.check()?;
        self.inner.remove_recurring(key).await
    }

    async fn due_recurring(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecurringDefinition>, StorageError> {
        self.check()?;
        self.inner.due_recurring(now).await
    }

    async fn fire_recurring(
        &self,
        key: &RecurringKey,
        expected_next: DateTime<Utc>,
        new_next: DateTime<Utc>,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, StorageError> {
        self.check()?;
        self.inner
            .fire_recurring(key, expected_next, new_next, job, now)
            .await
    }
}
