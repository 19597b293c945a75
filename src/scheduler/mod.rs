//! Scheduler engine for job execution.
//!
//! This module provides the dispatch loop that moves ready jobs into the
//! worker pool, the recurring scheduler, continuation handling and recovery
//! of jobs abandoned by a crashed process.

mod continuation;
mod dispatcher;
mod engine;
mod handle;
mod recurring;
mod types;

pub use continuation::ContinuationLinker;
pub use dispatcher::Dispatcher;
pub use engine::Scheduler;
pub use handle::SchedulerHandle;
pub use recurring::{RecurringJobRequest, RecurringScheduler};
pub use types::{SchedulerError, SchedulerState};
