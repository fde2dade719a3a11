//! Exponential backoff shared by the scheduler, the lease scheduler and the
//! batcher.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::serde_duration;

/// Retry policy.
///
/// The delay before retry `n` (1-based) is
/// `initial_delay * multiplier^(n-1)`, capped at `max_delay`, plus up to
/// `jitter` of that value chosen at random.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    pub multiplier: f64,
    #[serde(with = "serde_duration")]
    pub initial_delay: Duration,
    #[serde(with = "serde_duration")]
    pub max_delay: Duration,
    /// Fraction of the delay added as random jitter (0.0-1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            multiplier: 2.0,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given attempt budget and default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Builder: set backoff parameters.
    pub fn with_backoff(mut self, initial: Duration, max: Duration, multiplier: f64) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self.multiplier = multiplier;
        self
    }

    /// Builder: set jitter fraction.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = fraction.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry `retry` without jitter. Zero for `retry == 0`.
    pub fn base_delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let max = self.max_delay.as_secs_f64();

        if delay.is_finite() {
            Duration::from_secs_f64(delay.clamp(0.0, max))
        } else {
            self.max_delay
        }
    }

    /// Delay before retry `retry`, jitter included.
    pub fn backoff(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        let span = base.as_secs_f64() * self.jitter.clamp(0.0, 1.0);
        if span <= 0.0 {
            return base;
        }
        base + Duration::from_secs_f64(rand::random::<f64>() * span)
    }

    /// Like [`backoff`](Self::backoff) but never shorter than a server hint.
    pub fn backoff_with_hint(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let delay = self.backoff(retry);
        match hint {
            Some(hint) => delay.max(hint),
            None => delay,
        }
    }

    /// Returns true if another attempt is allowed after `attempts` tries.
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(0), Duration::ZERO);
        assert_eq!(policy.base_delay(1), Duration::from_secs(5));
        assert_eq!(policy.base_delay(2), Duration::from_secs(10));
        assert_eq!(policy.base_delay(3), Duration::from_secs(20));
        assert_eq!(policy.base_delay(10), Duration::from_secs(300));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn backoff_is_non_decreasing_within_jitter() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::ZERO;
        for retry in 1..=12 {
            let base = policy.base_delay(retry);
            assert!(base >= previous);
            for _ in 0..50 {
                let delay = policy.backoff(retry);
                assert!(delay >= base);
                assert!(delay <= base.mul_f64(1.0 + policy.jitter));
            }
            previous = base;
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let policy = RetryPolicy::default().with_jitter(0.0);
        assert_eq!(policy.backoff(2), Duration::from_secs(10));
    }

    #[test]
    fn hint_is_a_floor() {
        let policy = RetryPolicy::default().with_jitter(0.0);
        assert_eq!(
            policy.backoff_with_hint(1, Some(Duration::from_secs(60))),
            Duration::from_secs(60)
        );
        assert_eq!(
            policy.backoff_with_hint(1, Some(Duration::from_secs(1))),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn attempt_budget() {
        let policy = RetryPolicy::new(3);
        assert!(policy.allows_another(1));
        assert!(policy.allows_another(2));
        assert!(!policy.allows_another(3));
    }
}
