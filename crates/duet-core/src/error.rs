//! Error types for the coordination core.

use crate::store::StoreError;
use duet_protocol::{ConversationId, MessageId, UserId};
use thiserror::Error;

/// Errors surfaced by the core components.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Both participants are the same user.
    #[error("Cannot open a conversation with yourself")]
    SelfConversation,

    /// No conversation with this id exists.
    #[error("Conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    /// The user does not take part in the conversation.
    #[error("User {user} is not a participant of conversation {conversation}")]
    NotParticipant {
        user: UserId,
        conversation: ConversationId,
    },

    /// No message with this id exists.
    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    /// The payload names a user this connection does not route for.
    #[error("User {0} is not online on this connection")]
    NotBound(UserId),

    /// Message content exceeds the configured limit.
    #[error("Message content exceeds {0} characters")]
    ContentTooLong(usize),

    /// The durable store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl CoreError {
    /// Whether the failure was caused by the request rather than the store.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        !matches!(self, CoreError::Store(_))
    }
}
