//! Retry policy for queued jobs.
//!
//! Supports bounded retries with exponential backoff capped at a maximum delay.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy applied by the worker pool when a job fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries, not including the first delivery (0 = no retries).
    /// `max_retries = 5` allows up to 6 deliveries in total.
    pub max_retries: u32,

    /// Delay before the first retry.
    #[serde(with = "serde_duration")]
    pub base_delay: Duration,

    /// Upper bound for any single retry delay.
    #[serde(with = "serde_duration")]
    pub max_delay: Duration,

    /// Condition for when to retry.
    pub retry_on: RetryCondition,
}

/// Conditions under which a failed job is retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCondition {
    /// Retry on any error.
    Always,

    /// Retry only transient errors (storage, timeouts); permanent errors dead-letter.
    #[default]
    TransientOnly,

    /// Never retry, regardless of max_retries.
    Never,
}

impl RetryPolicy {
    /// Create a policy with no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            retry_on: RetryCondition::Never,
        }
    }

    /// Create a policy retrying with a constant delay.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            retry_on: RetryCondition::TransientOnly,
        }
    }

    /// Create a policy doubling the delay after every failure, up to `max_delay`.
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            retry_on: RetryCondition::TransientOnly,
        }
    }

    /// Builder: set the retry condition.
    pub fn with_condition(mut self, condition: RetryCondition) -> Self {
        self.retry_on = condition;
        self
    }

    /// Check if retries are enabled.
    pub fn is_enabled(&self) -> bool {
        self.max_retries > 0 && self.retry_on != RetryCondition::Never
    }

    /// Decide whether a job that failed on delivery number `attempts` is retried.
    ///
    /// # Arguments
    /// * `attempts` - Deliveries made so far, including the one that just failed
    /// * `transient` - Whether the failure is expected to clear on its own
    pub fn should_retry(&self, attempts: u32, transient: bool) -> bool {
        match self.retry_on {
            RetryCondition::Never => false,
            RetryCondition::TransientOnly if !transient => false,
            _ => attempts <= self.max_retries,
        }
    }

    /// Delay before the delivery following failed delivery number `attempts`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay.max(self.base_delay))
    }
}

impl Default for RetryPolicy {
    /// Default policy: 5 retries, 10s doubling up to 10 minutes, transient errors only.
    fn default() -> Self {
        Self::exponential(5, Duration::from_secs(10), Duration::from_secs(600))
    }
}

/// Serde helper for Duration serialization.
///
/// Serializes Duration as whole seconds (matching the YAML config format).
pub(crate) mod serde_duration {
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
