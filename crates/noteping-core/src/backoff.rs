//! Exponential backoff policy
//!
//! Delay before retry `n` (zero-based) is `base * 2^n`, optionally stretched
//! by up to `jitter * nominal`, and always capped at `max`. With `jitter`
//! within `[0, 1]` the resulting sequence is non-decreasing.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with optional jitter
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl BackoffPolicy {
    /// Create a policy without jitter
    #[inline]
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// No delay at all (useful for tests and the simulator)
    #[inline]
    #[must_use]
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// With jitter fraction, clamped into `[0, 1]`
    #[inline]
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_nan() {
            0.0
        } else {
            jitter.clamp(0.0, 1.0)
        };
        self
    }

    /// Base delay
    #[inline]
    #[must_use]
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Delay ceiling
    #[inline]
    #[must_use]
    pub fn max(&self) -> Duration {
        self.max
    }

    /// `base * 2^retry`, capped at `max`
    #[must_use]
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Delay for `retry` given a uniform sample `unit` in `[0, 1)`
    #[must_use]
    pub fn delay_with_unit(&self, retry: u32, unit: f64) -> Duration {
        let nominal = self.nominal_delay(retry);
        if self.jitter == 0.0 {
            return nominal;
        }
        let unit = unit.clamp(0.0, 1.0);
        let nominal_nanos = u64::try_from(nominal.as_nanos()).unwrap_or(u64::MAX);
        // Integer arithmetic keeps `extra <= nominal`, so the next doubling always dominates.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let extra = ((nominal_nanos as f64) * self.jitter * unit) as u64;
        let stretched = nominal.saturating_add(Duration::from_nanos(extra.min(nominal_nanos)));
        stretched.min(self.max)
    }

    /// Delay for `retry`, sampling jitter from the thread RNG
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        if self.jitter == 0.0 {
            return self.nominal_delay(retry);
        }
        self.delay_with_unit(retry, rand::random::<f64>())
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(8))
    }
}
