//! Job execution.
//!
//! This module provides the worker pool that runs claimed jobs and the
//! named-lock table that caps concurrent executions per concurrency key.

mod guard;
mod pool;

pub use guard::{GuardError, LockGuard, NamedLocks};
pub use pool::{PoolError, WorkerPool};
