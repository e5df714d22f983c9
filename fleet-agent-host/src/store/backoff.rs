//! Linear backoff for control channel errors

use std::time::Duration;

/// Upper bound on the wait between two reconnect attempts
pub const MAX_BACKOFF_SECS: u64 = 120;

/// Counts consecutive errors; the wait grows by one second per error
#[derive(Debug, Default, Clone)]
pub struct ErrorBackoff {
    consecutive: u64,
}

impl ErrorBackoff {
    /// Register a failure and return how long to wait before retrying
    pub fn record_error(&mut self) -> Duration {
        self.consecutive = self.consecutive.saturating_add(1);
        self.delay()
    }

    /// Any successful delivery clears the error streak
    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.consecutive.min(MAX_BACKOFF_SECS))
    }

    pub fn consecutive(&self) -> u64 {
        self.consecutive
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_linearly() {
        let mut backoff = ErrorBackoff::default();
        assert_eq!(backoff.delay(), Duration::ZERO);

        for n in 1..=5 {
            assert_eq!(backoff.record_error(), Duration::from_secs(n));
        }
        assert_eq!(backoff.consecutive(), 5);
    }

    #[test]
    fn test_delay_is_capped() {
        let mut backoff = ErrorBackoff::default();
        for _ in 0..500 {
            backoff.record_error();
        }
        assert_eq!(backoff.delay(), Duration::from_secs(MAX_BACKOFF_SECS));
    }

    #[test]
    fn test_success_resets_streak() {
        let mut backoff = ErrorBackoff::default();
        backoff.record_error();
        backoff.record_error();
        backoff.reset();

        assert_eq!(backoff.consecutive(), 0);
        assert_eq!(backoff.record_error(), Duration::from_secs(1));
    }
}
