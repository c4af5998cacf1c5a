//! Session state types

use std::fmt;

/// Connection lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected, no attempt in flight
    Idle,
    /// Connection attempt in flight
    Connecting,
    /// Connected, conversation quiescent
    Connected,
    /// User speech detected
    Listening,
    /// Assistant audio playing
    Speaking,
    /// Delegation to the reasoning model in progress
    Thinking,
    /// Recoverable failure; `connect` may be retried
    Error,
}

impl ConnectionState {
    /// Whether a live transport is expected in this state.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Listening | Self::Speaking | Self::Thinking
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Listening => "listening",
            Self::Speaking => "speaking",
            Self::Thinking => "thinking",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// What the assistant is doing right now, orthogonal to connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingMode {
    Idle,
    /// The low-latency model is handling the turn
    Realtime,
    /// A delegated query is with the reasoning model
    Thinking,
    /// The reasoning model reported it is searching
    Searching,
}

impl fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Realtime => "realtime",
            Self::Thinking => "thinking",
            Self::Searching => "searching",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connected_states() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(ConnectionState::Thinking.is_connected());
        assert!(!ConnectionState::Idle.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::Error.is_connected());
    }
}
