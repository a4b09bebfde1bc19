//! Step retry policy
//!
//! Exponential backoff with jitter. Only failure kinds that classify as
//! retryable are retried; a rate-limited failure carrying a Retry-After
//! hint waits at least that long.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use weft_core::ModuleError;

/// Retry policy applied to a step's module invocations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one)
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_interval: Duration,

    /// Ceiling on the delay between retries
    pub max_interval: Duration,

    /// Backoff multiplier (2.0 doubles the delay every retry)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0); 0.1 means +-10% randomness
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy for a step declaring `retries` extra attempts
    pub fn for_retries(retries: u32) -> Self {
        Self {
            max_attempts: retries + 1,
            ..Self::default()
        }
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }

    /// Whether this failure should be retried on the given attempt
    pub fn should_retry(&self, error: &ModuleError, current_attempt: u32) -> bool {
        error.retryable() && self.has_attempts_remaining(current_attempt)
    }

    /// Delay before the given attempt (1-based; attempt 1 has no delay)
    ///
    /// A Retry-After hint on the failed call raises the floor.
    pub fn delay_for_attempt(&self, attempt: u32, previous_error: Option<&ModuleError>) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let range = capped * self.jitter;
            (capped + rng.gen_range(-range..=range)).max(0.0)
        } else {
            capped
        };

        let mut delay = Duration::from_secs_f64(jittered);
        if let Some(retry_after) = previous_error.and_then(|e| e.retry_after_secs) {
            delay = delay.max(Duration::from_secs(retry_after));
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::ErrorKind;

    #[test]
    fn test_for_retries_counts_attempts() {
        let policy = RetryPolicy::for_retries(2);
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }

    #[test]
    fn test_only_retryable_kinds_retry() {
        let policy = RetryPolicy::for_retries(3);
        let transient = ModuleError::transient("flaky");
        let permanent = ModuleError::validation("bad input");

        assert!(policy.should_retry(&transient, 1));
        assert!(!policy.should_retry(&permanent, 1));
        assert!(!policy.should_retry(&transient, 4));
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::for_retries(4)
            .with_initial_interval(Duration::from_secs(1))
            .with_jitter(0.0);

        assert_eq!(policy.delay_for_attempt(1, None), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2, None), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3, None), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4, None), Duration::from_secs(4));
    }

    #[test]
    fn test_max_interval_caps_delay() {
        let policy = RetryPolicy::for_retries(10)
            .with_initial_interval(Duration::from_secs(1))
            .with_max_interval(Duration::from_secs(5))
            .with_jitter(0.0);
        assert_eq!(policy.delay_for_attempt(10, None), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_after_raises_floor() {
        let policy = RetryPolicy::for_retries(2).with_jitter(0.0);
        let rate_limited =
            ModuleError::new(ErrorKind::RateLimited, "slow down").with_retry_after(7);
        let delay = policy.delay_for_attempt(2, Some(&rate_limited));
        assert!(delay >= Duration::from_secs(7));
    }
}
