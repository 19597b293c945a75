//! Configuration loading and parsing.
//!
//! This module provides YAML-based configuration for the server: worker pool
//! and loop timings, retry policy, storage backend, API address and
//! per job type concurrency limits.

mod builder;
mod error;
mod types;
mod yaml;

pub use builder::SchedulerConfigBuilder;
pub use error::ConfigError;
pub use types::{
    ConcurrencyConfig, MAX_RECURRING_TICK_SECS, RetryConfig, ServerConfig, StorageConfig,
};
pub use yaml::YamlLoader;
