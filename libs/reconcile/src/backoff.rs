//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::{DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX};

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay for the first retry.
    pub base: Duration,

    /// Maximum delay before jitter is applied.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// A policy without jitter, useful where delays must be predictable.
    pub fn fixed_ratio(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Nominal delay for the given attempt (0-based), before jitter.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let factor = 2.0_f64.powi(attempt.min(31) as i32);
        let delay = (self.base.as_secs_f64() * factor).min(self.max.as_secs_f64());
        Duration::try_from_secs_f64(delay).unwrap_or(self.max)
    }

    /// Delay for the given attempt (0-based), with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal(attempt).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || nominal == 0.0 {
            return self.nominal(attempt);
        }

        let spread = nominal * jitter;
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::try_from_secs_f64((nominal + offset).max(0.0)).unwrap_or(self.max)
    }
}
