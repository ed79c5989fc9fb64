//! Bounded exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Backoff curve and retry limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First delay in milliseconds.
    pub initial_ms: u64,
    /// Delay cap in milliseconds.
    pub max_ms: u64,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Relative jitter in `[0, 1]`, applied symmetrically.
    pub jitter: f64,
    /// Consecutive attempts allowed before giving up.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: 50,
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `attempt` (zero based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = (self.initial_ms as f64 * factor).min(self.max_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Stateful backoff counter.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Creates a fresh counter.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Attempts consumed since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Forgets previous failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Next delay, or `None` once `max_attempts` is used up.
    #[instrument(skip(self), fields(attempt = self.attempt))]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            debug!("Backoff exhausted");
            return None;
        }

        let base = self.config.base_delay(self.attempt);
        self.attempt += 1;

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return Some(base);
        }

        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        let delay = base.mul_f64(factor).min(Duration::from_millis(self.config.max_ms));
        debug!(delay_ms = delay.as_millis() as u64, "Backing off");
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: f64, max_attempts: u32) -> BackoffConfig {
        BackoffConfig {
            initial_ms: 100,
            max_ms: 1_000,
            multiplier: 2.0,
            jitter,
            max_attempts,
        }
    }

    #[test]
    fn test_delays_grow_and_cap() {
        let mut backoff = Backoff::new(config(0.0, 10));
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.next_delay().expect("not exhausted").as_millis() as u64)
            .collect();
        assert_eq!(delays, [100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn test_exhaustion_and_reset() {
        let mut backoff = Backoff::new(config(0.0, 2));
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let mut backoff = Backoff::new(config(0.5, 100));
        for _ in 0..50 {
            backoff.reset();
            let delay = backoff.next_delay().expect("not exhausted");
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
