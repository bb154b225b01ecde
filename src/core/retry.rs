//! Retry delay policy for failed job attempts.
//!
//! Whether a failure is retried at all is decided by the job's `max_retries`
//! and the handler's `should_retry` flag. This module only decides how long to
//! wait before the next attempt when the handler gives no explicit delay.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry.
    Fixed,

    /// `base_delay * 2^retry_count`, capped at `max_delay`.
    #[default]
    Exponential,
}

/// Engine-wide default retry delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Growth strategy.
    #[serde(default)]
    pub backoff: BackoffStrategy,

    /// Delay before the first retry.
    #[serde(with = "serde_duration", default = "default_base_delay")]
    pub base_delay: Duration,

    /// Upper bound for any computed delay.
    #[serde(with = "serde_duration", default = "default_max_delay")]
    pub max_delay: Duration,
}

fn default_base_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(3600)
}

impl RetryPolicy {
    /// Create a policy with a fixed delay.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            backoff: BackoffStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
        }
    }

    /// Create an exponential policy.
    ///
    /// # Arguments
    /// * `base_delay` - Delay before the first retry
    /// * `max_delay` - Cap applied to every delay
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            backoff: BackoffStrategy::Exponential,
            base_delay,
            max_delay,
        }
    }

    /// Delay before the next attempt, given the retries already consumed.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let delay = match self.backoff {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
                self.base_delay
                    .checked_mul(factor)
                    .unwrap_or(self.max_delay)
            }
        };
        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(default_base_delay(), default_max_delay())
    }
}

/// Serializes Duration as whole seconds, matching the YAML config format.
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
