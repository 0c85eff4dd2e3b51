//! Retry Policy
//!
//! Exponential backoff with symmetric jitter, shared by the transport-open
//! and adapter-init phases.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per phase before giving up (default: 5)
    pub max_attempts: u32,
    /// Delay after the first failure in milliseconds (default: 1000)
    pub base_delay_ms: u64,
    /// Upper bound before jitter (default: 30000)
    pub max_delay_ms: u64,
    /// Growth factor per attempt (default: 2.0)
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random (default: 0.3)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Policy that never waits between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// At least one attempt is always made
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Capped exponential delay before jitter, for the `attempt`-th failure
    pub fn base_delay(&self, attempt: u32) -> f64 {
        let exponent = attempt.saturating_sub(1) as i32;
        let delay = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        delay.min(self.max_delay_ms as f64)
    }

    /// Delay after the `attempt`-th failure
    ///
    /// `unit` in `[-1, 1]` selects where in the jitter band the delay lands;
    /// the result is rounded to whole milliseconds and never negative.
    pub fn delay_with(&self, attempt: u32, unit: f64) -> Duration {
        let capped = self.base_delay(attempt);
        let jitter = capped * self.jitter.clamp(0.0, 1.0) * unit.clamp(-1.0, 1.0);
        let millis = (capped + jitter).round().max(0.0);
        Duration::from_millis(millis as u64)
    }

    /// Delay after the `attempt`-th failure with random jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let unit = rand::thread_rng().gen_range(-1.0..=1.0);
        self.delay_with(attempt, unit)
    }
}
