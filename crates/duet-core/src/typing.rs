//! Typing indicator relay.
//!
//! Typing signals are forwarded to the receiver's live connection and
//! forgotten. Expiry is left to the sending client.

use crate::connection::ConnectionId;
use crate::presence::PresenceRegistry;
use duet_protocol::ServerEvent;
use std::sync::Arc;
use tracing::trace;

/// An outbound event addressed to one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub connection: ConnectionId,
    pub event: ServerEvent,
}

/// Routes typing signals through the presence registry.
#[derive(Debug, Clone)]
pub struct TypingRelay {
    presence: Arc<PresenceRegistry>,
}

impl TypingRelay {
    /// Create a relay over `presence`.
    #[must_use]
    pub fn new(presence: Arc<PresenceRegistry>) -> Self {
        Self { presence }
    }

    /// Route a `typing:start` from `sender` to `receiver`.
    ///
    /// Returns `None` if the receiver is offline.
    #[must_use]
    pub fn start(&self, sender: &str, receiver: &str) -> Option<Dispatch> {
        self.route(receiver, ServerEvent::typing_start(sender))
    }

    /// Route a `typing:stop` from `sender` to `receiver`.
    ///
    /// Returns `None` if the receiver is offline.
    #[must_use]
    pub fn stop(&self, sender: &str, receiver: &str) -> Option<Dispatch> {
        self.route(receiver, ServerEvent::typing_stop(sender))
    }

    fn route(&self, receiver: &str, event: ServerEvent) -> Option<Dispatch> {
        let Some(connection) = self.presence.lookup(receiver) else {
            trace!(receiver = %receiver, event = event.name(), "Typing signal dropped, receiver offline");
            return None;
        };
        Some(Dispatch { connection, event })
    }
}
