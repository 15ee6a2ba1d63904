//! Retry policy for outbound jobs.
//!
//! The policy only answers two questions (may this job try again, and after how
//! long); the scheduler owns the timers.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed,
    /// `delay * factor^(n-1)` before retry `n`, capped at `max_delay`.
    Exponential { factor: u32, max_delay: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: Backoff,
    /// Upper bound of the random delay added to each retry
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(60),
            backoff: Backoff::Fixed,
            jitter: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            backoff: Backoff::Fixed,
            jitter: Duration::ZERO,
        }
    }

    /// True while a job that has made `attempts` attempts may make another.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay after the `failed_attempts`-th failure, without jitter.
    pub fn base_delay(&self, failed_attempts: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential { factor, max_delay } => {
                let exp = failed_attempts.saturating_sub(1);
                let multiplier = factor.max(1).checked_pow(exp).unwrap_or(u32::MAX);
                self.delay.saturating_mul(multiplier).min(max_delay)
            }
        }
    }

    /// Delay after the `failed_attempts`-th failure, jitter included.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let base = self.base_delay(failed_attempts);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_three_attempts_a_minute_apart() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_retry(1));
        assert!(policy.allows_retry(2));
        assert!(!policy.allows_retry(3));
        assert_eq!(policy.delay_for(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(2), Duration::from_secs(60));
    }

    #[test]
    fn exponential_grows_and_caps() {
        let policy = RetryPolicy {
            backoff: Backoff::Exponential {
                factor: 2,
                max_delay: Duration::from_secs(200),
            },
            ..RetryPolicy::default()
        };
        assert_eq!(policy.base_delay(1), Duration::from_secs(60));
        assert_eq!(policy.base_delay(2), Duration::from_secs(120));
        assert_eq!(policy.base_delay(3), Duration::from_secs(200));
        assert_eq!(policy.base_delay(100), Duration::from_secs(200));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy {
            delay: Duration::from_millis(10),
            jitter: Duration::from_millis(5),
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let d = policy.delay_for(1);
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(15));
        }
    }
}
