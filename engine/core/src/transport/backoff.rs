//! Reconnect Backoff
//!
//! Exponential schedule without jitter: the n-th attempt after a drop waits
//! `base * 2^n`, with n starting at 1. The counter only resets once a
//! connection has fully opened.

use std::time::Duration;

/// Largest exponent applied to the base delay
const MAX_EXPONENT: u32 = 16;

/// Reconnect attempt counter and delay schedule
#[derive(Clone, Debug)]
pub struct ReconnectBackoff {
    base: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl ReconnectBackoff {
    /// Create a schedule with the given floor and attempt cap
    #[must_use]
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay for a given attempt number
    #[must_use]
    pub fn delay_for_attempt(base: Duration, attempt: u32) -> Duration {
        base.saturating_mul(1u32 << attempt.min(MAX_EXPONENT))
    }

    /// Advance to the next attempt
    ///
    /// Returns `None` once the cap has been reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(Self::delay_for_attempt(self.base, self.attempt))
    }

    /// Reset after a successful open
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts scheduled since the last reset
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Attempt cap
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_delay_is_doubled_base() {
        let mut backoff = ReconnectBackoff::new(Duration::from_millis(100), 5);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.attempts(), 1);
    }

    #[test]
    fn test_schedule_and_cap() {
        let mut backoff = ReconnectBackoff::new(Duration::from_millis(100), 5);
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            [200, 400, 800, 1600, 3200].map(Duration::from_millis).to_vec()
        );
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut backoff = ReconnectBackoff::new(Duration::from_millis(100), 5);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
    }

    #[test]
    fn test_zero_attempts_never_retries() {
        let mut backoff = ReconnectBackoff::new(Duration::from_millis(100), 0);
        assert_eq!(backoff.next_delay(), None);
    }
}
