//! Reconnect backoff for the push channel.
//!
//! Exponential from `base_delay`, doubling per consecutive failure, capped at
//! `max_delay`. Jitter is subtracted from the capped value so a delay never
//! exceeds the cap while viewers sharing an outage still spread out.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_ms;

/// Configuration for reconnect backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay after the first failure (default: 1s).
    #[serde(with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    /// Upper bound for any delay (default: 30s).
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Fraction of the delay that may be shaved off at random (default: 0.2).
    pub jitter_ratio: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the next attempt after `failures` consecutive failures
    /// (1-based; 0 is treated as 1).
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let unit = if self.jitter_ratio > 0.0 {
            rand::rng().random_range(0.0..1.0)
        } else {
            0.0
        };
        self.delay_with_jitter(failures, unit)
    }

    /// Deterministic core of [`delay_for_attempt`](Self::delay_for_attempt):
    /// `unit` in `[0, 1)` selects how much of the jitter band is removed.
    pub fn delay_with_jitter(&self, failures: u32, unit: f64) -> Duration {
        let capped = self.capped_delay(failures);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0) * unit.clamp(0.0, 1.0);
        capped.mul_f64(1.0 - ratio)
    }

    /// Exponential delay before jitter.
    pub fn capped_delay(&self, failures: u32) -> Duration {
        // 2^20 × any sane base is already far beyond the cap
        let exp = failures.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}
