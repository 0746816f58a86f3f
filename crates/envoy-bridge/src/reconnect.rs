//! Exponential backoff for broker reconnection.

use std::time::Duration;

/// Backoff parameters for broker reconnection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive failures.
    pub backoff_multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay after the `failures`-th consecutive failure (1-based).
    #[must_use]
    pub fn delay_for_failure(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.backoff_multiplier.powi(exponent);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}

/// Consecutive-failure counter driving a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    failures: u32,
}

impl Backoff {
    /// Creates a counter with no recorded failures.
    #[must_use]
    pub const fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    /// Records a failure and returns how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        self.policy.delay_for_failure(self.failures)
    }

    /// Clears the failure count after a successful connection.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures since the last reset.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_policy_default() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.backoff_multiplier, 2.0);
    }

    #[test_case(0, 1 ; "zero treated as first")]
    #[test_case(1, 1 ; "first")]
    #[test_case(2, 2 ; "second")]
    #[test_case(4, 8 ; "fourth")]
    #[test_case(6, 32 ; "sixth")]
    #[test_case(7, 60 ; "capped")]
    #[test_case(500, 60 ; "huge exponent")]
    fn test_delay_for_failure(failures: u32, expected_secs: u64) {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for_failure(failures), Duration::from_secs(expected_secs));
    }

    #[test]
    fn test_fractional_multiplier() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 1.5,
        };
        assert_eq!(policy.delay_for_failure(3), Duration::from_millis(225));
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        let mut backoff = Backoff::default();

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.failures(), 3);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
