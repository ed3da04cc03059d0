//! Retry policy with exponential backoff
//!
//! The node executor owns the retry loop; this module decides whether a
//! failure may retry and how long to sleep before the next attempt.

use crate::config::ExecutorConfig;
use crate::error::EngineError;
use std::time::Duration;

/// Per-node retry policy, derived from engine defaults with node-level
/// overrides applied.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// First backoff delay, doubled each retry
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay,
        }
    }

    /// Whether another attempt is allowed after `attempt` failed.
    /// `CIRCUIT_OPEN`, config, and validation failures never retry.
    pub fn should_retry(&self, error: &EngineError, attempt: u32) -> bool {
        attempt < self.max_attempts && error.is_recoverable()
    }

    /// Backoff before attempt `attempt + 1`: `min(base · 2^(attempt-1), max)`
    /// with ±20% jitter so synchronized failures do not retry in lockstep.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let base_ms = self.base_delay.as_millis() as u64;
        let capped = base_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay.as_millis() as u64);
        // jitter in [0.8, 1.2]
        let factor = 0.8 + fastrand::f64() * 0.4;
        Duration::from_millis(((capped as f64) * factor) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ExecutorConfig::default())
    }
}
