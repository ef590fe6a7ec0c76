//! Exponential reconnect backoff shared by the feed adapters.

use std::time::Duration;

/// Capped exponential backoff: `min(initial * 2^attempts, max)`, at most
/// `max_attempts` delays. A successful connection resets the counter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            max_attempts,
            attempts: 0,
        }
    }

    /// Delay before the next reconnect attempt, or None once the cap is hit.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let exp = self.initial.saturating_mul(1u32 << self.attempts.min(16));
        self.attempts += 1;
        Some(exp.min(self.max))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_until_max() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(8), 10);
        assert_eq!(b.next_delay(), Some(Duration::from_secs(1)));
        assert_eq!(b.next_delay(), Some(Duration::from_secs(2)));
        assert_eq!(b.next_delay(), Some(Duration::from_secs(4)));
        assert_eq!(b.next_delay(), Some(Duration::from_secs(8)));
        // Capped at max from here on
        assert_eq!(b.next_delay(), Some(Duration::from_secs(8)));
    }

    #[test]
    fn test_attempt_cap() {
        let mut b = Backoff::new(Duration::from_millis(10), Duration::from_secs(1), 3);
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert_eq!(b.next_delay(), None);
        assert_eq!(b.next_delay(), None);
    }

    #[test]
    fn test_reset_restores_schedule() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 2);
        b.next_delay();
        b.next_delay();
        assert_eq!(b.next_delay(), None);
        b.reset();
        assert_eq!(b.next_delay(), Some(Duration::from_secs(1)));
    }
}
