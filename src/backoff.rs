//! Bounded retry with exponential backoff and jitter.
//!
//! Retries are modeled as an explicit state machine — an attempt counter and
//! a computed next delay — so callers can distinguish "retry after this
//! delay" from "give up" without catching and re-matching errors in a loop.

use std::time::Duration;

use rand::Rng;

/// Retry policy: attempt ceiling plus delay curve.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = max_retries + 1.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_ms: u64, max_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
        }
    }

    /// Start a fresh attempt sequence under this policy.
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 0,
        }
    }
}

/// One in-progress attempt sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    /// Attempts made so far (starts at 0 before the first try).
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Record a failed attempt. Returns the delay to sleep before retrying,
    /// or `None` when the attempt budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.attempt > self.policy.max_retries {
            return None;
        }

        // base * 2^(attempt-1), capped, with up to 50% additive jitter.
        let exp = self
            .policy
            .base_delay
            .saturating_mul(1u32 << (self.attempt - 1).min(16));
        let capped = exp.min(self.policy.max_delay);
        let jitter_ms = rand::rng().random_range(0..=capped.as_millis().max(1) as u64 / 2);
        Some(capped + Duration::from_millis(jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_and_stop() {
        let policy = RetryPolicy::new(3, 100, 10_000);
        let mut b = policy.start();

        let d1 = b.next_delay().unwrap();
        let d2 = b.next_delay().unwrap();
        let d3 = b.next_delay().unwrap();
        assert!(b.next_delay().is_none());
        assert_eq!(b.attempts(), 4);

        assert!(d1 >= Duration::from_millis(100));
        assert!(d2 >= Duration::from_millis(200));
        assert!(d3 >= Duration::from_millis(400));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy::new(10, 1000, 2000);
        let mut b = policy.start();
        for _ in 0..10 {
            let d = b.next_delay().unwrap();
            // Cap plus at most 50% jitter.
            assert!(d <= Duration::from_millis(3000));
        }
    }

    #[test]
    fn test_zero_retries_fails_immediately() {
        let policy = RetryPolicy::new(0, 100, 1000);
        let mut b = policy.start();
        assert!(b.next_delay().is_none());
        assert_eq!(b.attempts(), 1);
    }
}
