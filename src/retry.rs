//! Backoff policy for retrying operations against the advertising platform
//!
//! Every retrying loop in the engine takes a [`BackoffPolicy`] value instead of
//! hard-coding sleep durations.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with bounded jitter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Growth factor applied per additional attempt
    pub multiplier: f64,
    /// Upper bound for the random jitter added to each delay
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_jitter: Duration::from_millis(250),
        }
    }
}

impl BackoffPolicy {
    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_jitter: Duration::ZERO,
        }
    }

    /// Fixed delay between attempts, no jitter
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            multiplier: 1.0,
            max_jitter: Duration::ZERO,
        }
    }

    /// Whether another attempt is allowed after `attempts_made` attempts
    pub fn allows_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }

    /// Delay before the attempt following `attempts_made` failed attempts.
    ///
    /// `attempts_made` starts at 1 for the delay after the first failure.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(16) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let base = Duration::from_secs_f64(scaled);

        let jitter_ms = self.max_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}
