//! # stint
//!
//! A background job scheduler: deferred, delayed, continuation and recurring
//! jobs dispatched from named queues to a bounded worker pool, with per job
//! type concurrency limits and pluggable persistence.
//!
//! ## Example
//!
//! ```rust,no_run
//! use stint::{HandlerError, HandlerRegistry, InMemoryStore, JobContext, Scheduler, handler_fn};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = HandlerRegistry::new();
//! registry.register(
//!     "greet",
//!     handler_fn(|ctx: JobContext| async move {
//!         let name: String = ctx.arguments()?;
//!         println!("Hello, {}", name);
//!         Ok::<(), HandlerError>(())
//!     }),
//! );
//!
//! let scheduler = Scheduler::new(InMemoryStore::new(), registry);
//! let client = scheduler.client();
//! let (handle, _task) = scheduler.start().await;
//!
//! client.enqueue("greet", "Alice").await?;
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod client;
pub mod config;
pub mod core;
pub mod demo;
pub mod events;
pub mod execution;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use client::{JobClient, JobRequest, SubmitError};
pub use config::{ConfigError, SchedulerConfigBuilder, ServerConfig, StorageConfig, YamlLoader};
pub use core::handler::{
    ConcurrencyLimit, HandlerError, HandlerRegistry, JobContext, JobHandler, handler_fn,
};
pub use core::job::{JobFilter, JobRecord, JobState, NewJob, StateCounts};
pub use core::recurring::RecurringDefinition;
pub use core::retry::RetryPolicy;
pub use core::schedule::{Schedule, ScheduleError};
pub use core::types::{DEFAULT_QUEUE, JobId, QueueName, RecurringKey};
pub use events::{Event, EventBus, EventHandler, RequeueReason, TracingHandler};
pub use execution::{GuardError, NamedLocks, PoolError, WorkerPool};
pub use scheduler::{
    RecurringJobRequest, RecurringScheduler, Scheduler, SchedulerError, SchedulerHandle,
    SchedulerState,
};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStore;
pub use storage::{InMemoryStore, JobStore, StorageError};
