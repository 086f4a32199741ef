//! Retry budget and backoff schedule for transient write failures.
//!
//! The schedule is a fixed list of delays rather than a multiplier, so the
//! delay sequence is exactly what operators configure. The last delay is
//! reused if the budget outgrows the list.

use std::time::Duration;

/// Default attempt budget per chunk (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delays between attempts, in milliseconds.
pub const DEFAULT_DELAYS_MS: [u64; 3] = [100, 500, 1000];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    pub max_attempts: u32,
    /// Delay before retry `n` is `delays[min(n - 1, len - 1)]`.
    pub delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delays: DEFAULT_DELAYS_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        }
    }
}

impl RetryPolicy {
    /// A policy with `max_attempts` and no waiting between them.
    pub fn without_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delays: Vec::new(),
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if self.delays.is_empty() {
            return Duration::ZERO;
        }
        let idx = (attempt.saturating_sub(1) as usize).min(self.delays.len() - 1);
        self.delays[idx]
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(500));
        assert_eq!(policy.delay_after(3), Duration::from_millis(1000));
    }

    #[test]
    fn last_delay_is_reused() {
        let policy = RetryPolicy {
            max_attempts: 10,
            ..Default::default()
        };
        assert_eq!(policy.delay_after(7), Duration::from_millis(1000));
    }

    #[test]
    fn budget_counts_first_attempt() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn without_delay_never_waits() {
        let policy = RetryPolicy::without_delay(0);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.delay_after(1), Duration::ZERO);
        assert!(!policy.should_retry(1));
    }
}
