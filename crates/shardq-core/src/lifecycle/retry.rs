//! Retry policy: decides backoff delays.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Backoff for recoverable failures.
///
/// `delay = min(base_delay * multiplier^(failures - 1), max_delay)`, then
/// optionally shortened by up to `jitter_ratio` of itself.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,

    pub multiplier: f64,

    /// Cap applied before jitter.
    pub max_delay: Duration,

    /// 0.0 disables jitter, 1.0 allows anything in `[0, delay]`.
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            jitter_ratio: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio.clamp(0.0, 1.0);
        self
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            config.multiplier,
            Duration::from_millis(config.max_delay_ms),
        )
        .with_jitter(config.jitter_ratio)
    }

    /// Deterministic part of the delay.
    ///
    /// `failures` is 1 for the first failure; 0 is treated like 1.
    ///
    /// Example with base_delay=2s, multiplier=2.0:
    /// - failure 1: 2s
    /// - failure 2: 4s
    /// - failure 3: 8s
    pub fn next_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Delay with jitter drawn from `rng`.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let delay = self.next_delay(failures);
        if self.jitter_ratio <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.jitter_ratio;
        let cut = rng.gen_range(0.0..=spread);
        Duration::from_secs_f64(delay.as_secs_f64() - cut)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
