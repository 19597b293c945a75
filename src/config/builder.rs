//! Scheduler builder from server configuration.
//!
//! This module turns a validated [`ServerConfig`] into a configured
//! [`Scheduler`], applying configured concurrency limits to the registry.

use std::sync::Arc;

use crate::core::handler::{ConcurrencyLimit, HandlerRegistry};
use crate::core::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::storage::JobStore;

use super::error::ConfigError;
use super::types::ServerConfig;

/// Builder for creating a Scheduler from configuration.
pub struct SchedulerConfigBuilder;

impl SchedulerConfigBuilder {
    /// Build a Scheduler over `store` with the handlers in `registry`.
    ///
    /// Configured limits replace limits given at registration. A limit for
    /// a job type with no registered handler is rejected.
    pub fn build<S: JobStore + 'static>(
        config: &ServerConfig,
        store: Arc<S>,
        registry: HandlerRegistry,
    ) -> Result<Scheduler<S>, ConfigError> {
        config.validate()?;
        let registry = Self::apply_limits(config, registry)?;

        let scheduler = Scheduler::with_storage(store, registry)
            .with_queues(config.queue_names())
            .with_workers(config.workers)
            .with_poll_interval(config.poll_interval())
            .with_submit_timeout(config.submit_timeout())
            .with_recurring_tick(config.recurring_tick())
            .with_invisibility_timeout(config.invisibility_timeout())
            .with_shutdown_timeout(config.shutdown_timeout())
            .with_retry_policy(RetryPolicy::from(&config.retry));

        Ok(scheduler)
    }

    /// Apply the configured concurrency limits to a registry.
    pub fn apply_limits(
        config: &ServerConfig,
        mut registry: HandlerRegistry,
    ) -> Result<HandlerRegistry, ConfigError> {
        for (job_type, limit) in &config.concurrency {
            if !registry.set_limit(job_type, ConcurrencyLimit::from(limit)) {
                return Err(ConfigError::invalid(format!(
                    "concurrency limit given for unregistered job type '{}'",
                    job_type
                )));
            }
            tracing::debug!(
                job_type = %job_type,
                max_concurrent = limit.max_concurrent,
                "Applied concurrency limit"
            );
        }
        Ok(registry)
    }
}
