//! Retry policy for transient channel failures.

use std::time::Duration;

use courier_common::config::DeliveryConfig;
use courier_common::error::ChannelError;

/// What to do with a job after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration, error: String },
    Fail { reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            cap: Duration::from_secs(config.backoff_cap_secs),
        }
    }

    /// Un-jittered delay after `attempts` finished attempts: `2^attempts` seconds, capped.
    pub fn base_delay(&self, attempts: u32) -> Duration {
        let secs = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.cap)
    }

    /// Base delay with ±25% jitter.
    pub fn delay(&self, attempts: u32) -> Duration {
        let base = self.base_delay(attempts).as_millis() as u64;
        let spread = base / 4;
        if spread == 0 {
            return Duration::from_millis(base);
        }
        let jittered = base - spread + rand::random_range(0..=spread * 2);
        Duration::from_millis(jittered)
    }

    /// Classify a failure. `attempts` counts finished attempts including this one.
    pub fn decide(&self, attempts: u32, error: &ChannelError) -> RetryDecision {
        match error {
            ChannelError::Permanent(reason) => RetryDecision::Fail {
                reason: reason.clone(),
            },
            ChannelError::Transient(reason) if attempts >= self.max_attempts => {
                RetryDecision::Fail {
                    reason: format!("max attempts exceeded: {}", reason),
                }
            }
            ChannelError::Transient(reason) => RetryDecision::Retry {
                delay: self.delay(attempts),
                error: reason.clone(),
            },
        }
    }
}
