//! Named locks that cap concurrent executions per concurrency key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::handler::ConcurrencyLimit;

/// Errors that can occur when acquiring a named lock.
#[derive(Debug, Error)]
pub enum GuardError {
    /// The lock was not acquired within the limit's timeout.
    #[error("timed out after {timeout:?} waiting for lock '{key}'")]
    LockTimeout { key: String, timeout: Duration },

    /// The lock table is unusable.
    #[error("lock table unavailable: {0}")]
    Unavailable(String),
}

/// A held slot of a named lock. The slot is released on drop.
#[derive(Debug)]
pub struct LockGuard {
    key: String,
    _permit: OwnedSemaphorePermit,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Table of counting locks keyed by concurrency key.
///
/// Each key gets a semaphore sized by the first limit it is acquired with.
#[derive(Debug, Default)]
pub struct NamedLocks {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl NamedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn semaphore(&self, key: &str, permits: usize) -> Result<Arc<Semaphore>, GuardError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| GuardError::Unavailable("lock table poisoned".into()))?;
        Ok(Arc::clone(
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(permits.max(1)))),
        ))
    }

    /// Acquire one slot of `key`, waiting at most `limit.timeout`.
    pub async fn acquire(
        &self,
        key: &str,
        limit: ConcurrencyLimit,
    ) -> Result<LockGuard, GuardError> {
        let semaphore = self.semaphore(key, limit.max_concurrent)?;
        match tokio::time::timeout(limit.timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(LockGuard {
                key: key.to_string(),
                _permit: permit,
            }),
            Ok(Err(_)) => Err(GuardError::Unavailable(format!("lock '{}' closed", key))),
            Err(_) => Err(GuardError::LockTimeout {
                key: key.to_string(),
                timeout: limit.timeout,
            }),
        }
    }

    /// Free slots of `key`, or `None` if it was never acquired.
    pub fn available(&self, key: &str) -> Option<usize> {
        let locks = self.locks.lock().ok()?;
        locks.get(key).map(|s| s.available_permits())
    }
}
