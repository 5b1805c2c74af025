//! Exponential backoff with jitter

use rand::Rng;
use std::time::Duration;

/// Upper bound on jitter as a fraction of the undithered delay
pub const MAX_JITTER: f64 = 0.1;

/// `base * 2^(attempt-1) * (1 + jitter)` with jitter drawn from `[0, 0.1)`
pub fn backoff_delay(attempt: u32, base: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.0..MAX_JITTER);
    backoff_delay_with_jitter(attempt, base, jitter)
}

/// Deterministic form of [`backoff_delay`]
pub fn backoff_delay_with_jitter(attempt: u32, base: Duration, jitter: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(20) as i32;
    let jitter = jitter.clamp(0.0, MAX_JITTER);
    base.mul_f64(2f64.powi(exponent) * (1.0 + jitter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_per_attempt() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay_with_jitter(1, base, 0.0), Duration::from_millis(100));
        assert_eq!(backoff_delay_with_jitter(2, base, 0.0), Duration::from_millis(200));
        assert_eq!(backoff_delay_with_jitter(3, base, 0.0), Duration::from_millis(400));
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay_with_jitter(0, base, 0.0), base);
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_millis(100);
        for attempt in 1..=4 {
            let floor = backoff_delay_with_jitter(attempt, base, 0.0);
            let ceiling = floor.mul_f64(1.0 + MAX_JITTER);
            for _ in 0..50 {
                let delay = backoff_delay(attempt, base);
                assert!(delay >= floor && delay <= ceiling, "{:?}", delay);
            }
        }
    }
}
