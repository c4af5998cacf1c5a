//! Reconnection policy
//!
//! Unexpected disconnects are retried with exponential backoff up to a fixed
//! ceiling of attempts; intentional disconnects and normal closes never retry.

use std::time::Duration;

const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 30_000;

/// Maximum automatic reconnection attempts before giving up
pub const MAX_ATTEMPTS: u32 = 5;

/// Delay before reconnection attempt `attempt` (1-based).
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(10);
    let ms = (BACKOFF_BASE_MS << shift).min(BACKOFF_CAP_MS);
    Duration::from_millis(ms)
}

/// Tracks consecutive failed reconnection attempts
#[derive(Debug, Default)]
pub struct ReconnectState {
    attempts: u32,
}

impl ReconnectState {
    /// Claim the next attempt number, or `None` when the budget is spent.
    pub fn next_attempt(&mut self) -> Option<u32> {
        if self.attempts >= MAX_ATTEMPTS {
            return None;
        }
        self.attempts += 1;
        Some(self.attempts)
    }

    /// Reset the counter after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(2), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(3), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(4), Duration::from_millis(8_000));
        assert_eq!(backoff_delay(5), Duration::from_millis(16_000));
        assert_eq!(backoff_delay(6), Duration::from_millis(30_000));
        assert_eq!(backoff_delay(100), Duration::from_millis(30_000));
    }

    #[test]
    fn attempts_exhaust_after_the_ceiling() {
        let mut state = ReconnectState::default();
        for expected in 1..=MAX_ATTEMPTS {
            assert_eq!(state.next_attempt(), Some(expected));
        }
        assert_eq!(state.next_attempt(), None);
        assert_eq!(state.attempts(), MAX_ATTEMPTS);
    }

    #[test]
    fn reset_restores_the_budget() {
        let mut state = ReconnectState::default();
        state.next_attempt();
        state.next_attempt();
        state.reset();
        assert_eq!(state.attempts(), 0);
        assert_eq!(state.next_attempt(), Some(1));
    }
}
