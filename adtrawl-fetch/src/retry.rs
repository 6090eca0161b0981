//! Backoff policies for the request executor and the collection engine.
//!
//! Two ramps coexist on purpose: the executor's exponential backoff, and
//! the collection engine's linear in-band ramps. The in-band ceilings end a
//! search quietly while the executor's exhaustion raises; that asymmetry is
//! inherited operating behavior, kept as-is.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with bounded uniform jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Maximum number of attempts before giving up.
    pub max_retries: u32,
    /// Base delay, doubled per attempt.
    pub base_delay: Duration,
    /// Upper bound of the jitter added to every wait.
    pub max_jitter: Duration,
    /// Hard cap on any single wait.
    pub max_delay: Duration,
}

impl BackoffPolicy {
    /// Creates a policy with the given attempt ceiling.
    pub fn new(max_retries: u32, base_delay: Duration, max_jitter: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_jitter,
            max_delay: Duration::from_secs(60),
        }
    }

    /// Wait before the next attempt: `base * 2^attempt + jitter`.
    ///
    /// `attempt` is zero-based. Ignoring jitter, the wait strictly
    /// increases with the attempt index until the cap.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        exp + jitter(self.max_jitter)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2), Duration::from_secs(1))
    }
}

/// Uniform random jitter in `[0, max)`.
pub fn jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..max.as_secs_f64()))
}

/// Escalating wait for in-band rate-limit signals: `5 * attempt + jitter`.
pub fn rate_limit_wait(attempt: u32, max_jitter: Duration) -> Duration {
    Duration::from_secs(5 * u64::from(attempt)) + jitter(max_jitter)
}

/// Linear wait applied when a page fetch raised: `3 * attempt` seconds.
pub fn exception_wait(attempt: u32) -> Duration {
    Duration::from_secs(3 * u64::from(attempt))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_monotone_modulo_jitter() {
        let policy = BackoffPolicy::new(5, Duration::from_secs(2), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(16));
    }

    #[test]
    fn test_delay_capped() {
        let policy = BackoffPolicy::new(10, Duration::from_secs(2), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_bounded() {
        let max = Duration::from_millis(500);
        for _ in 0..100 {
            assert!(jitter(max) < max);
        }
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_inband_ramps() {
        assert_eq!(rate_limit_wait(2, Duration::ZERO), Duration::from_secs(10));
        assert_eq!(exception_wait(1), Duration::from_secs(3));
        assert_eq!(exception_wait(3), Duration::from_secs(9));
    }
}
