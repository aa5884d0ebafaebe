//! Exponential backoff for persistence retries

use std::time::Duration;

/// Upper bound on a single delay
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Doubling backoff with a fixed number of attempts
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay_ms: u64,
    max_attempts: u32,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(base_delay_ms: u64, max_attempts: u32) -> Self {
        ExponentialBackoff {
            base_delay_ms,
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next retry, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }

        let factor = 1u64.checked_shl(self.attempt).unwrap_or(u64::MAX);
        self.attempt += 1;

        let delay = Duration::from_millis(self.base_delay_ms.saturating_mul(factor));
        Some(delay.min(MAX_DELAY))
    }

    /// Retries consumed so far
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double() {
        let mut backoff = ExponentialBackoff::new(100, 3);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn test_delay_is_capped() {
        let mut backoff = ExponentialBackoff::new(10_000, 10);
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(delays.len(), 10);
        assert!(delays.iter().all(|d| *d <= MAX_DELAY));
        assert_eq!(*delays.last().unwrap(), MAX_DELAY);
    }

    #[test]
    fn test_zero_attempts() {
        let mut backoff = ExponentialBackoff::new(100, 0);
        assert_eq!(backoff.next_delay(), None);
    }
}
