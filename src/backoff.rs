use std::cmp;
use std::time::Duration;

use rand::Rng;

/// Reconnect delay schedule. Fixed delay by default, truncated
/// exponential doubling when enabled. A random jitter ([0, 250] ms) is
/// added to avoid reconnect synchronization across clients
pub(crate) struct Backoff {
    min: Duration,
    max: Duration,
    exponential: bool,
    attempts: u32,
}

// doubling beyond this can't produce a larger delay before truncation
const MAX_ATTEMPTS: u32 = 32;

impl Backoff {
    pub fn new(min: Duration, max: Duration, exponential: bool) -> Backoff {
        Backoff {
            min,
            max,
            exponential,
            attempts: 0,
        }
    }

    /// Forget previous failures after a successful connection
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Delay to wait before the next connection attempt
    pub fn next_delay(&mut self) -> Duration {
        let base = if self.exponential {
            self.min * 2_u32.saturating_pow(self.attempts)
        } else {
            self.min
        };

        if self.attempts < MAX_ATTEMPTS {
            self.attempts += 1;
        }

        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=250));
        cmp::min(base, self.max) + jitter
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fixed_schedule_stays_at_min() {
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(32),
            false,
        );

        for _ in 0..5 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_secs(1));
            assert!(delay < Duration::from_millis(1500));
        }
    }

    #[test]
    fn exponential_schedule_doubles_and_truncates() {
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(4),
            true,
        );

        assert!(backoff.next_delay() < Duration::from_millis(1500));
        assert!(backoff.next_delay() >= Duration::from_secs(2));
        assert!(backoff.next_delay() >= Duration::from_secs(4));

        // truncated at max from here on
        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_secs(4));
        assert!(delay < Duration::from_millis(4500));
    }

    #[test]
    fn reset_starts_the_schedule_over() {
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(32),
            true,
        );

        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert!(backoff.next_delay() < Duration::from_millis(1500));
    }
}
