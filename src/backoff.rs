//! Retry pacing: exponential backoff with jitter for transient fetch errors.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
    jitter_fraction: f64,
}

impl RetryPolicy {
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter_fraction: 0.25,
        }
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
    /// capped, plus up to `jitter_fraction` of the capped value.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let exponential = base_ms.saturating_mul(2u64.saturating_pow(attempt.min(16)));
        let capped = exponential.min(self.cap.as_millis() as u64);

        let jitter_max = (capped as f64 * self.jitter_fraction) as u64;
        let jitter = if jitter_max > 0 {
            rand::thread_rng().gen_range(0..=jitter_max)
        } else {
            0
        };

        Duration::from_millis(capped + jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_without_jitter() {
        let policy =
            RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(60)).with_jitter(0.0);
        assert_eq!(policy.delay(0).as_millis(), 100);
        assert_eq!(policy.delay(1).as_millis(), 200);
        assert_eq!(policy.delay(3).as_millis(), 800);
    }

    #[test]
    fn cap_bounds_the_delay() {
        let policy =
            RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(500)).with_jitter(0.0);
        assert_eq!(policy.delay(10).as_millis(), 500);
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let policy =
            RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(1)).with_jitter(0.5);
        for attempt in 0..5 {
            let base = 100u128 * 2u128.pow(attempt);
            let capped = base.min(1000);
            let delay = policy.delay(attempt).as_millis();
            assert!(delay >= capped);
            assert!(delay <= capped + capped / 2);
        }
    }
}
