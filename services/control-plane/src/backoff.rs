//! Exponential backoff for restarting background loops.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay, before jitter.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (starting at 0).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2.0_f64.powi(attempt.min(32) as i32);
        let delay = (self.base.as_millis() as f64 * exp).min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 100)]
    #[case(1, 200)]
    #[case(3, 800)]
    #[case(20, 30_000)]
    #[case(u32::MAX, 30_000)]
    fn test_delay_within_jitter_bounds(#[case] attempt: u32, #[case] expected_ms: u64) {
        let policy = BackoffPolicy::default();
        let low = Duration::from_millis(expected_ms * 3 / 4);
        let high = Duration::from_millis(expected_ms * 5 / 4);

        for _ in 0..50 {
            let delay = policy.delay(attempt);
            assert!(delay >= low && delay <= high, "{delay:?} outside {low:?}..{high:?}");
        }
    }

    #[test]
    fn test_no_jitter_is_exact() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.delay(2), Duration::from_millis(400));
    }
}
