//! World Stage Interface
//!
//! The I/O loop hands every framed inbound message to a [`WorldSink`]. Calls
//! happen on the I/O thread, so implementations must return quickly; the
//! channel-backed implementation just enqueues.

use tokio::sync::mpsc;
use tracing::warn;

use crate::network::session::{Session, SessionId};

/// Receiver of inbound traffic and session lifecycle notifications.
pub trait WorldSink: Send + 'static {
    /// A complete, validated message arrived from `session`.
    fn deliver_inbound(&self, session: SessionId, payload: Vec<u8>);

    /// A connection was accepted.
    fn session_opened(&self, _session: &Session) {}

    /// A session was purged from the registry.
    fn session_closed(&self, _session: SessionId) {}
}

/// Framed inbound message tagged with its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Originating session.
    pub session_id: SessionId,
    /// Application payload.
    pub payload: Vec<u8>,
}

/// Event stream produced for a channel-backed world stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorldEvent {
    /// New connection (snapshot taken at accept time).
    Connected(Session),
    /// Inbound message.
    Message(InboundMessage),
    /// Session purged.
    Disconnected(SessionId),
}

impl WorldSink for mpsc::UnboundedSender<WorldEvent> {
    fn deliver_inbound(&self, session: SessionId, payload: Vec<u8>) {
        let event = WorldEvent::Message(InboundMessage {
            session_id: session,
            payload,
        });
        if self.send(event).is_err() {
            warn!(session, "World stage gone, dropping inbound message");
        }
    }

    fn session_opened(&self, session: &Session) {
        let _ = self.send(WorldEvent::Connected(session.clone()));
    }

    fn session_closed(&self, session: SessionId) {
        let _ = self.send(WorldEvent::Disconnected(session));
    }
}

/// Create an unbounded world event channel.
pub fn world_channel() -> (mpsc::UnboundedSender<WorldEvent>, mpsc::UnboundedReceiver<WorldEvent>) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_tags_messages() {
        let (tx, mut rx) = world_channel();
        tx.deliver_inbound(7, b"ping".to_vec());
        tx.session_closed(7);

        assert_eq!(
            rx.try_recv().unwrap(),
            WorldEvent::Message(InboundMessage {
                session_id: 7,
                payload: b"ping".to_vec(),
            })
        );
        assert_eq!(rx.try_recv().unwrap(), WorldEvent::Disconnected(7));
    }

    #[test]
    fn test_closed_world_does_not_panic() {
        let (tx, rx) = world_channel();
        drop(rx);
        tx.deliver_inbound(1, vec![1, 2, 3]);
        tx.session_closed(1);
    }
}
