//! Retry policy: decides backoff delays.

use std::time::Duration;

/// Exponential backoff used when (re-)registering worker leases and
/// re-subscribing liveness watches.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
        }
    }

    /// Registration retries never wait longer than the lease they are trying to create.
    pub fn for_lease(ttl: Duration) -> Self {
        Self::new(Duration::from_millis(500), 2.0, ttl)
    }

    /// delay = base_delay * multiplier^(attempts - 1), capped at `max_delay`.
    ///
    /// `attempts` is 1-indexed; 0 is treated like 1.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exponent = attempts.saturating_sub(1).min(32) as i32;
        let delay_secs = base_secs * self.multiplier.powi(exponent);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_increases() {
        let policy = RetryPolicy::new(Duration::from_secs(2), 2.0, Duration::from_secs(60));

        assert_eq!(policy.next_delay(0), Duration::from_secs(2));
        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy::for_lease(Duration::from_secs(4));
        assert_eq!(policy.next_delay(1), Duration::from_millis(500));
        assert_eq!(policy.next_delay(4), Duration::from_secs(4));
        assert_eq!(policy.next_delay(1000), Duration::from_secs(4));
    }
}
