//! Configuration type definitions.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working in-memory server on the default queue.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::error::ConfigError;
use crate::api::ApiConfig;
use crate::core::handler::ConcurrencyLimit;
use crate::core::retry::RetryPolicy;
use crate::core::types::{DEFAULT_QUEUE, QueueName};

/// Longest allowed recurring tick; occurrences are per-minute at the finest.
pub const MAX_RECURRING_TICK_SECS: u64 = 60;

/// Server configuration (stint.yaml).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Queues served by the dispatcher, in priority order.
    pub queues: Vec<String>,
    /// Worker pool size.
    pub workers: usize,
    pub poll_interval_ms: u64,
    /// How long the dispatcher waits for a free worker slot.
    pub submit_timeout_ms: u64,
    pub recurring_tick_secs: u64,
    /// Processing jobs without a heartbeat for this long are requeued.
    pub invisibility_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub retry: RetryConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    /// Concurrency limits by job type.
    pub concurrency: BTreeMap<String, ConcurrencyConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            queues: vec![DEFAULT_QUEUE.to_string()],
            workers: 4,
            poll_interval_ms: 1000,
            submit_timeout_ms: 5000,
            recurring_tick_secs: 15,
            invisibility_timeout_secs: 300,
            shutdown_timeout_secs: 30,
            retry: RetryConfig::default(),
            storage: StorageConfig::default(),
            api: ApiConfig::default(),
            concurrency: BTreeMap::new(),
        }
    }
}

impl ServerConfig {
    /// Check values that would leave the server unable to run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queues.is_empty() {
            return Err(ConfigError::invalid("at least one queue is required"));
        }
        if let Some(blank) = self.queues.iter().find(|q| q.trim().is_empty()) {
            return Err(ConfigError::invalid(format!(
                "queue names cannot be blank: {:?}",
                blank
            )));
        }
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers cannot be zero"));
        }
        if self.recurring_tick_secs == 0 || self.recurring_tick_secs > MAX_RECURRING_TICK_SECS {
            return Err(ConfigError::invalid(format!(
                "recurring_tick_secs must be between 1 and {}, got {}",
                MAX_RECURRING_TICK_SECS, self.recurring_tick_secs
            )));
        }
        if self.invisibility_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "invisibility_timeout_secs cannot be zero",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts cannot be zero"));
        }
        if self.retry.base_delay_secs > self.retry.max_delay_secs {
            return Err(ConfigError::invalid(
                "retry.base_delay_secs cannot exceed retry.max_delay_secs",
            ));
        }
        if matches!(&self.storage, StorageConfig::Sqlite { path } if path.trim().is_empty()) {
            return Err(ConfigError::invalid("storage.path cannot be empty"));
        }
        for (job_type, limit) in &self.concurrency {
            if limit.max_concurrent == 0 {
                return Err(ConfigError::invalid(format!(
                    "concurrency limit for '{}' cannot be zero",
                    job_type
                )));
            }
        }
        Ok(())
    }

    pub fn queue_names(&self) -> Vec<QueueName> {
        self.queues.iter().map(QueueName::new).collect()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn recurring_tick(&self) -> Duration {
        Duration::from_secs(self.recurring_tick_secs)
    }

    pub fn invisibility_timeout(&self) -> Duration {
        Duration::from_secs(self.invisibility_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 1,
            max_delay_secs: 300,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy::exponential(
            config.max_attempts.saturating_sub(1),
            Duration::from_secs(config.base_delay_secs),
            Duration::from_secs(config.max_delay_secs),
        )
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// Per job type concurrency limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub max_concurrent: usize,
    /// How long a job waits for a slot before it is requeued.
    #[serde(default = "default_lock_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_lock_timeout_secs() -> u64 {
    60
}

impl From<&ConcurrencyConfig> for ConcurrencyLimit {
    fn from(config: &ConcurrencyConfig) -> Self {
        ConcurrencyLimit::new(
            config.max_concurrent,
            Duration::from_secs(config.timeout_secs),
        )
    }
}
