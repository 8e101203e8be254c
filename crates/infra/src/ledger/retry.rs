//! Retry policy for optimistic writes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    Exponential,
    /// Linear backoff: base * attempt
    #[default]
    Linear,
}

/// Bounded retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Base delay between attempts
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0): the delay varies by up to ±factor of itself.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            strategy: BackoffStrategy::Linear,
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// Fixed delays, no jitter.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Linear backoff with the default cap and jitter.
    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    /// Delay to wait after failed attempt `attempt` (1-indexed).
    ///
    /// `seed` spreads competing callers apart; any per-call varying number
    /// works (the ledger uses the clock's sub-second nanos).
    pub fn delay_for_attempt(&self, attempt: u32, seed: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi((attempt - 1) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * f64::from(attempt)).min(max_ms),
        };

        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let unit = f64::from(seed % 1000) / 1000.0;
            jitter_range * (unit - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    /// Whether another attempt is allowed after `attempt` attempts were made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_three_linear_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn linear_delay_grows_and_is_capped() {
        let policy = RetryPolicy {
            jitter: 0.0,
            max_delay: Duration::from_millis(120),
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(1, 0), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(2, 0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3, 0), Duration::from_millis(120));
    }

    #[test]
    fn jitter_stays_within_range() {
        let policy = RetryPolicy::default();
        for seed in [0, 250, 499, 500, 999, 123_456_789] {
            let delay = policy.delay_for_attempt(2, seed);
            assert!(delay >= Duration::from_millis(50), "{delay:?}");
            assert!(delay <= Duration::from_millis(150), "{delay:?}");
        }
    }

    #[test]
    fn exponential_doubles() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(3, 0), Duration::from_millis(200));
    }

    #[test]
    fn fixed_ignores_attempt() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(4, 77), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(0, 77), Duration::ZERO);
    }
}
