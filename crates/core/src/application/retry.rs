// Retry policy for broker operations
// Publishing and (re)connecting are never retried implicitly: callers pass a
// policy, and the default policy makes exactly one attempt.
use std::time::Duration;
use tracing::{info, warn};

use crate::application::consumer::constants::DEFAULT_RETRY_BASE_DELAY;

/// Retry decision result
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the given delay
    Retry(Duration),
    /// Attempts exhausted
    GiveUp,
}

/// Bounded exponential backoff
///
/// `max_attempts` counts the first try, so `max_attempts = 1` disables retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
}

impl RetryPolicy {
    /// Create a new retry policy
    ///
    /// # Arguments
    /// * `max_attempts` - Total attempts including the first (clamped to at least 1)
    /// * `base_delay` - Delay before the second attempt
    ///
    /// # Example
    /// ```text
    /// let policy = RetryPolicy::new(3, Duration::from_millis(500));
    /// ```
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff_factor: 2.0,
        }
    }

    /// Single attempt, no retry
    pub fn none() -> Self {
        Self::new(1, DEFAULT_RETRY_BASE_DELAY)
    }

    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 1
    }

    /// Decide whether attempt number `attempt` (1-based, just failed) gets a successor
    ///
    /// Backoff formula:
    /// delay = base_delay * (backoff_factor ^ (attempt - 1)) * jitter
    ///
    /// `key` seeds a deterministic +/-10% jitter so that many producers
    /// failing at once do not retry in lockstep.
    pub fn should_retry(&self, attempt: u32, key: &str) -> RetryDecision {
        if attempt >= self.max_attempts {
            if self.is_enabled() {
                warn!(
                    key = %key,
                    attempts = attempt,
                    max_attempts = self.max_attempts,
                    "Max retry attempts reached"
                );
            }
            return RetryDecision::GiveUp;
        }

        let exponent = attempt.saturating_sub(1) as i32;
        let base_ms = self.base_delay.as_millis() as f64 * self.backoff_factor.powi(exponent);

        let jitter_seed = key.chars().map(|c| c as u32).sum::<u32>();
        let jitter_factor = 0.9 + ((jitter_seed % 21) as f64 / 100.0); // 0.9 to 1.1

        let delay = Duration::from_millis((base_ms * jitter_factor) as u64);

        info!(
            key = %key,
            attempt = attempt,
            max_attempts = self.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling retry"
        );

        RetryDecision::Retry(delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_never_retries() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_enabled());
        assert_eq!(policy.should_retry(1, "loan-1"), RetryDecision::GiveUp);
    }

    #[test]
    fn test_backoff_grows_and_stays_within_jitter() {
        let policy = RetryPolicy::new(4, Duration::from_millis(1000));

        let delays: Vec<Duration> = (1..4)
            .map(|attempt| match policy.should_retry(attempt, "loan-42") {
                RetryDecision::Retry(d) => d,
                RetryDecision::GiveUp => panic!("attempt {} should retry", attempt),
            })
            .collect();

        assert!(delays[0] >= Duration::from_millis(900));
        assert!(delays[0] <= Duration::from_millis(1100));
        assert!(delays[1] > delays[0]);
        assert!(delays[2] > delays[1]);
        assert_eq!(policy.should_retry(4, "loan-42"), RetryDecision::GiveUp);
    }

    #[test]
    fn test_jitter_is_deterministic_per_key() {
        let policy = RetryPolicy::new(3, Duration::from_millis(200));
        assert_eq!(policy.should_retry(1, "abc"), policy.should_retry(1, "abc"));
    }

    #[test]
    fn test_zero_attempts_clamped() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }
}
