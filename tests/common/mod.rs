//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use stint::{HandlerRegistry, JobId, JobRecord, JobState, JobStore, RetryPolicy, Scheduler};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(10);

/// Build a registry from `(job_type, handler, limit)` entries.
macro_rules! registry {
    ($(($job_type:expr, $handler:expr, $limit:expr $(,)?)),* $(,)?) => {{
        let mut registry = stint::HandlerRegistry::new();
        $(registry.register_arc($job_type, $handler, $limit);)*
        registry
    }};
}
pub(crate) use registry;

/// A scheduler with short loop periods and fast retries.
pub fn fast_scheduler<S: JobStore + 'static>(store: Arc<S>, registry: HandlerRegistry) -> Scheduler<S> {
    Scheduler::with_storage(store, registry)
        .with_poll_interval(Duration::from_millis(10))
        .with_recurring_tick(Duration::from_millis(20))
        .with_retry_policy(RetryPolicy::exponential(
            3,
            Duration::from_millis(10),
            Duration::from_millis(50),
        ))
        .with_shutdown_timeout(Duration::from_secs(2))
}

/// Wait for a job to reach an expected state, polling storage.
///
/// This is more reliable than fixed sleeps since execution time can vary.
///
/// # Panics
///
/// Panics if the timeout is reached before the job reaches the state.
pub async fn wait_for_job_state<S: JobStore + ?Sized>(
    store: &S,
    id: &JobId,
    expected: JobState,
) -> JobRecord {
    match stint::testing::wait_for_state(store, id, expected, WAIT).await {
        Some(job) => job,
        None => {
            let current = store.get_job(id).await.map(|job| job.state);
            panic!(
                "Timeout waiting for job {} to reach {}, current state: {:?}",
                id, expected, current
            );
        }
    }
}

/// Poll `condition` every 10ms until it holds or `WAIT` passes.
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    true
}
