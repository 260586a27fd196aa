//! # Fibonacci Backoff
//!
//! Progressive per-item delay for the event queue. Grows more slowly than
//! exponential backoff, which suits reconcile triggers: a hot item is
//! throttled quickly but never pushed out to unreasonable delays.
//!
//! Sequence for (min, max) = (5ms, 10s): 5, 5, 10, 15, 25, 40, ... capped.

use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each delay is the sum of the previous two, starting from `min` and
/// capped at `max`. `reset` restores the initial state after a success.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min: Duration,
    max: Duration,
    prev: Duration,
    current: Duration,
}

impl FibonacciBackoff {
    /// Create a new backoff with the given minimum and maximum delays.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            prev: Duration::ZERO,
            current: min,
        }
    }

    /// Returns the next delay and advances the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = self.prev + self.current;
        self.prev = self.current;
        self.current = next.min(self.max);
        delay
    }

    /// Restores the initial state.
    pub fn reset(&mut self) {
        self.prev = Duration::ZERO;
        self.current = self.min;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follows_fibonacci_sequence() {
        let mut backoff = FibonacciBackoff::new(Duration::from_millis(5), Duration::from_secs(10));

        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(15));
        assert_eq!(backoff.next_delay(), Duration::from_millis(25));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
    }

    #[test]
    fn caps_at_max() {
        let mut backoff = FibonacciBackoff::new(Duration::from_millis(5), Duration::from_millis(20));

        let mut last = Duration::ZERO;
        for _ in 0..10 {
            last = backoff.next_delay();
        }
        assert_eq!(last, Duration::from_millis(20));
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut backoff = FibonacciBackoff::new(Duration::from_millis(5), Duration::from_secs(10));

        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();

        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }
}
