//! Exponential backoff with jitter
//!
//! Shared by health quarantine, circuit breakers and the retry policy so all
//! three grow their delays the same way.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay for step 0
    pub initial: Duration,
    /// Upper bound for the un-jittered delay
    pub max: Duration,
    /// Growth factor per step
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.2 = ±20%)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            ..Default::default()
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Capped delay for `step`, without jitter
    pub fn base_delay(&self, step: u32) -> Duration {
        let exp = self.multiplier.powi(step.min(i32::MAX as u32) as i32);
        let nanos = self.initial.as_nanos() as f64 * exp;
        let max = self.max.as_nanos() as f64;
        if nanos.is_nan() || nanos >= max {
            self.max
        } else {
            Duration::from_nanos(nanos.round() as u64)
        }
    }

    /// Capped delay for `step` with ±`jitter` randomization applied
    pub fn delay(&self, step: u32) -> Duration {
        let base = self.base_delay(step);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        let jittered = base.as_nanos() as f64 * (1.0 + factor);
        Duration::from_nanos(jittered.max(0.0).round() as u64)
    }

    pub(crate) fn validate(&self, what: &str) -> std::result::Result<(), String> {
        if self.initial.is_zero() {
            return Err(format!("{what}: initial backoff must be > 0"));
        }
        if self.max < self.initial {
            return Err(format!("{what}: max backoff must be >= initial backoff"));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(format!("{what}: backoff multiplier must be >= 1.0"));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(format!("{what}: jitter must be in [0.0, 1.0)"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_and_cap() {
        let backoff = BackoffConfig::new(Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(0.0);

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
        assert_eq!(backoff.delay(60), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_bounds() {
        let backoff = BackoffConfig::new(Duration::from_millis(1000), Duration::from_secs(10))
            .with_jitter(0.25);

        for _ in 0..200 {
            let delay = backoff.delay(0);
            assert!(delay >= Duration::from_millis(749), "{:?}", delay);
            assert!(delay <= Duration::from_millis(1251), "{:?}", delay);
        }
    }

    #[test]
    fn test_validation() {
        assert!(BackoffConfig::default().validate("x").is_ok());
        assert!(BackoffConfig::default().with_jitter(1.5).validate("x").is_err());
        assert!(BackoffConfig::default().with_multiplier(0.5).validate("x").is_err());
        assert!(BackoffConfig::new(Duration::from_secs(2), Duration::from_secs(1))
            .validate("x")
            .is_err());
    }
}
