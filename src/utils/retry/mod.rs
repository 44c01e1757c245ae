//! Retry configuration with exponential backoff, cap, and jitter.
//!
//! Used for feed redelivery and for callers that opt into retrying
//! commands after version conflicts.

use std::time::Duration;

use backon::ExponentialBuilder;
use serde::Deserialize;

/// Configuration for backoff behavior.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub min_delay_ms: u64,
    /// Cap on any single delay.
    pub max_delay_ms: u64,
    /// Retries after the initial attempt.
    pub max_attempts: usize,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 10,
            max_delay_ms: 2_000,
            max_attempts: 10,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Retry of commands rejected by a version conflict.
    ///
    /// - Min delay: 10ms
    /// - Max delay: 2s
    /// - Max attempts: 10
    /// - Jitter enabled
    pub fn for_commands() -> Self {
        Self::default()
    }

    /// Redelivery of events whose handler failed.
    ///
    /// - Min delay: 100ms
    /// - Max delay: 30s
    /// - Max attempts: 10
    /// - Jitter enabled
    pub fn for_redelivery() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 30_000,
            max_attempts: 10,
            jitter: true,
        }
    }

    /// Millisecond delays without jitter.
    pub fn for_test() -> Self {
        Self {
            min_delay_ms: 1,
            max_delay_ms: 10,
            max_attempts: 5,
            jitter: false,
        }
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.min_delay())
            .with_max_delay(self.max_delay())
            .with_max_times(self.max_attempts);
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }
}
