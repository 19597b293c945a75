//! Retry policy for failed jobs.
//!
//! Failed attempts are retried as new job rows with an exponentially growing
//! delay, capped at a maximum. The same backoff shape is reused by the
//! scheduler loops when the store is unavailable.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy applied when a handler returns an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries, not including the initial attempt (0 = no retries).
    /// For example, `max_attempts = 3` allows up to 4 executions in total.
    pub max_attempts: u32,

    /// Delay before the first retry. Each further retry doubles it.
    #[serde(with = "serde_duration")]
    pub base_delay: Duration,

    /// Upper bound for the delay between attempts.
    #[serde(with = "serde_duration")]
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Create a policy with exponential backoff.
    ///
    /// # Arguments
    /// * `max_attempts` - Maximum retries (not including the initial try)
    /// * `base_delay` - Delay before the first retry
    /// * `max_delay` - Cap for any single delay
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Check if retries are enabled.
    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 0
    }

    /// Check if another attempt should follow the given one.
    ///
    /// # Arguments
    /// * `attempt` - 1-based number of the attempt that just failed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    /// Default policy: 3 retries starting at 1s, capped at 5 minutes.
    fn default() -> Self {
        Self::exponential(3, Duration::from_secs(1), Duration::from_secs(300))
    }
}

/// Serde helper for Duration serialization.
///
/// Serializes Duration as whole seconds (matching the YAML config format).
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
