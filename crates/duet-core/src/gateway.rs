//! Event gateway.
//!
//! The gateway is the only component that sees connections. It turns
//! inbound [`ClientEvent`]s into calls on the presence registry, the
//! delivery state machine, and the typing relay, and routes the resulting
//! [`ServerEvent`]s into per-connection outboxes. The transport drains each
//! outbox onto its socket.

use crate::connection::ConnectionId;
use crate::delivery::MessageDelivery;
use crate::error::CoreError;
use crate::presence::PresenceRegistry;
use crate::store::MessageStore;
use crate::typing::{Dispatch, TypingRelay};
use dashmap::DashMap;
use duet_protocol::{ClientEvent, ReadMessages, SendMessage, ServerEvent};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Sending half of a connection's outbound queue.
pub type Outbox = mpsc::UnboundedSender<ServerEvent>;

const SEND_FAILED: &str = "Failed to send message";
const READ_FAILED: &str = "Failed to mark messages as read";
const TYPING_FAILED: &str = "Failed to relay typing indicator";

fn failure_action(event: &ClientEvent) -> &'static str {
    match event {
        ClientEvent::ReadMessages(_) => READ_FAILED,
        ClientEvent::TypingStart(_) | ClientEvent::TypingStop(_) => TYPING_FAILED,
        _ => SEND_FAILED,
    }
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Maximum message content length in characters.
    pub max_content_length: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_content_length: 10_000,
        }
    }
}

/// Gateway statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayStats {
    /// Open connections, identified or not.
    pub connection_count: usize,
    /// Users currently online.
    pub online_count: usize,
}

/// Entry and exit point for all client events.
pub struct EventGateway {
    presence: Arc<PresenceRegistry>,
    delivery: MessageDelivery,
    typing: TypingRelay,
    outboxes: DashMap<ConnectionId, Outbox>,
    config: GatewayConfig,
}

impl EventGateway {
    /// Create a gateway over `store` with default configuration.
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self::with_config(store, GatewayConfig::default())
    }

    /// Create a gateway over `store` with custom configuration.
    #[must_use]
    pub fn with_config(store: Arc<dyn MessageStore>, config: GatewayConfig) -> Self {
        let presence = Arc::new(PresenceRegistry::new());
        Self {
            typing: TypingRelay::new(Arc::clone(&presence)),
            delivery: MessageDelivery::new(store),
            presence,
            outboxes: DashMap::new(),
            config,
        }
    }

    /// The presence registry.
    #[must_use]
    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    /// The delivery state machine.
    #[must_use]
    pub fn delivery(&self) -> &MessageDelivery {
        &self.delivery
    }

    /// Get gateway statistics.
    #[must_use]
    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            connection_count: self.outboxes.len(),
            online_count: self.presence.count(),
        }
    }

    /// Register a new connection.
    ///
    /// The connection is not bound to any user until it sends `user:online`.
    /// Returns its handle and the receiving half of its outbox.
    pub fn open(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let connection = ConnectionId::generate();
        let (tx, rx) = mpsc::unbounded_channel();
        self.outboxes.insert(connection.clone(), tx);
        debug!(connection = %connection, "Connection opened");
        (connection, rx)
    }

    /// Tear down a connection.
    ///
    /// Always releases every presence binding the connection still holds.
    pub fn close(&self, connection: &ConnectionId) {
        self.outboxes.remove(connection);
        let offline = self.presence.disconnect(connection);
        if offline.is_empty() {
            debug!(connection = %connection, "Connection closed (no presence)");
        } else {
            debug!(connection = %connection, users = ?offline, "Connection closed");
        }
    }

    /// Answer an inbound frame that could not be decoded.
    pub fn reject(&self, connection: &ConnectionId, reason: impl fmt::Display) {
        debug!(connection = %connection, reason = %reason, "Rejected inbound event");
        self.send(connection, ServerEvent::error(format!("Malformed event: {}", reason)));
    }

    /// Process one inbound event from `connection`.
    pub async fn handle(&self, connection: &ConnectionId, event: ClientEvent) {
        if let Err(reason) = event.validate() {
            self.reject(connection, reason);
            return;
        }

        trace!(connection = %connection, event = event.name(), "Inbound event");

        if let Some(actor) = event.actor() {
            if !self.presence.is_bound(actor, connection) {
                let err = CoreError::NotBound(actor.to_string());
                self.fail(connection, failure_action(&event), &err);
                return;
            }
        }

        match event {
            ClientEvent::UserOnline(user) => {
                self.presence.connect(user, connection.clone());
            }
            ClientEvent::GetOnlineUsers => {
                self.send(connection, ServerEvent::users_online(self.presence.snapshot()));
            }
            ClientEvent::SendMessage(send) => self.send_message(connection, send).await,
            ClientEvent::TypingStart(signal) => {
                self.dispatch(self.typing.start(&signal.sender_id, &signal.receiver_id));
            }
            ClientEvent::TypingStop(signal) => {
                self.dispatch(self.typing.stop(&signal.sender_id, &signal.receiver_id));
            }
            ClientEvent::ReadMessages(read) => self.read_messages(connection, read).await,
        }
    }

    /// Send `event` to every open connection.
    ///
    /// Returns the number of connections the event was queued for.
    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        self.outboxes
            .iter()
            .filter(|outbox| outbox.send(event.clone()).is_ok())
            .count()
    }

    /// Forward presence changes to every connection as `users:online`.
    ///
    /// The task ends once the gateway is dropped.
    pub fn spawn_presence_fanout(self: &Arc<Self>) -> JoinHandle<()> {
        let mut changes = self.presence.subscribe();
        let gateway = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                let online = match changes.recv().await {
                    Ok(change) => change.online,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Presence fanout lagged, resending snapshot");
                        match gateway.upgrade() {
                            Some(gateway) => gateway.presence.snapshot(),
                            None => break,
                        }
                    }
                    Err(RecvError::Closed) => break,
                };

                let Some(gateway) = gateway.upgrade() else {
                    break;
                };
                let recipients = gateway.broadcast(&ServerEvent::users_online(online));
                trace!(recipients, "Presence broadcast");
            }
            debug!("Presence fanout stopped");
        })
    }

    async fn send_message(&self, connection: &ConnectionId, send: SendMessage) {
        let content_length = send.content.chars().count();
        if content_length > self.config.max_content_length {
            let err = CoreError::ContentTooLong(self.config.max_content_length);
            self.fail(connection, SEND_FAILED, &err);
            return;
        }

        let message = match self
            .delivery
            .submit(&send.sender_id, &send.receiver_id, send.content)
            .await
        {
            Ok(message) => message,
            Err(e) => {
                self.fail(connection, SEND_FAILED, &e);
                return;
            }
        };

        let mut ack = message.clone();
        match self.presence.lookup(&message.receiver) {
            Some(target) => {
                if self.send(&target, ServerEvent::NewMessage(message.clone())) {
                    match self.delivery.mark_delivered(message.id).await {
                        Ok(current) => ack = current,
                        Err(e) => warn!(
                            message = message.id,
                            error = %e,
                            "Delivery status update failed, message stays sent"
                        ),
                    }
                }
            }
            None => {
                debug!(message = message.id, receiver = %message.receiver, "Receiver offline, message stored");
            }
        }

        self.send(connection, ServerEvent::MessageSent(ack));
    }

    async fn read_messages(&self, connection: &ConnectionId, read: ReadMessages) {
        match self
            .delivery
            .mark_read(read.conversation_id, &read.user_id)
            .await
        {
            Ok(outcome) => {
                if let Some(peer) = outcome.receipt_recipient() {
                    if let Some(target) = self.presence.lookup(peer) {
                        self.send(&target, ServerEvent::read_receipt(read.conversation_id));
                    }
                }
            }
            Err(e) => self.fail(connection, READ_FAILED, &e),
        }
    }

    fn dispatch(&self, dispatch: Option<Dispatch>) {
        if let Some(Dispatch { connection, event }) = dispatch {
            self.send(&connection, event);
        }
    }

    fn fail(&self, connection: &ConnectionId, action: &str, err: &CoreError) {
        let message = if err.is_client_error() {
            debug!(connection = %connection, error = %err, "{}", action);
            format!("{}: {}", action, err)
        } else {
            warn!(connection = %connection, error = %err, "{}", action);
            format!("{}.", action)
        };
        self.send(connection, ServerEvent::error(message));
    }

    // A missing or closed outbox means the connection is gone; the event is dropped.
    fn send(&self, connection: &ConnectionId, event: ServerEvent) -> bool {
        let Some(outbox) = self.outboxes.get(connection) else {
            trace!(connection = %connection, event = event.name(), "Dropped event for closed connection");
            return false;
        };
        outbox.send(event).is_ok()
    }
}
