//! Session event bus
//!
//! The orchestrator emits discrete state-change events rather than relying on
//! any UI framework's reactivity; a consumer subscribes and renders however it
//! likes. Emission is best-effort: having no subscribers is not an error.

use tokio::sync::broadcast;

use crate::session::state::{ConnectionState, ProcessingMode};

/// Default buffer size for the broadcast channel
const CHANNEL_CAPACITY: usize = 256;

/// Observable session changes
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Connection state transition
    StateChanged(ConnectionState),
    /// Processing mode transition
    ModeChanged(ProcessingMode),
    /// A new transcript entry was appended
    TranscriptAppended(String),
    /// The streaming transcript entry was extended by this delta
    TranscriptExtended(String),
    /// Microphone input level (RMS, 0.0 to 1.0)
    Volume(f32),
    /// The observable error message changed
    SessionError(String),
}

/// Broadcast bus for [`SessionEvent`]s
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribe to session events from this point forward.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers (best-effort, never fails).
    pub fn emit(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("no session event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(SessionEvent::Volume(0.25));
        match rx.recv().await {
            Ok(SessionEvent::Volume(v)) => assert!((v - 0.25).abs() < f32::EPSILON),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(SessionEvent::StateChanged(ConnectionState::Idle));
    }
}
