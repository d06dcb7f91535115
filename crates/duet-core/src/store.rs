//! Durable store contract.
//!
//! The core persists conversations and messages only through
//! [`MessageStore`]. Implementations must enforce two guarantees the core
//! relies on:
//!
//! - at most one conversation per [`ParticipantPair`], reporting a
//!   duplicate create as [`StoreError::Conflict`];
//! - status updates only ever move a message forward.

use crate::conversation::ParticipantPair;
use async_trait::async_trait;
use duet_protocol::{
    Conversation, ConversationId, ConversationSummary, Message, MessageId, MessageStatus, UserId,
};
use thiserror::Error;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A record with the same unique key already exists.
    #[error("Unique constraint violated: {0}")]
    Conflict(String),

    /// The referenced record does not exist.
    #[error("Record not found: {0}")]
    Missing(String),

    /// The backend could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// A message about to be persisted.
///
/// The store assigns the id, sequence number, and creation time; new
/// messages always start out [`MessageStatus::Sent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub receiver: UserId,
    pub content: String,
}

/// Which messages a status update applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusTarget {
    /// A single message.
    Message(MessageId),
    /// Every message in a conversation addressed to `receiver`.
    Inbox {
        conversation_id: ConversationId,
        receiver: UserId,
    },
}

/// Persistence contract used by the core.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Find the conversation for a participant pair.
    async fn find_conversation(
        &self,
        pair: &ParticipantPair,
    ) -> Result<Option<Conversation>, StoreError>;

    /// Find a conversation by id.
    async fn find_conversation_by_id(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, StoreError>;

    /// Create the conversation for a participant pair.
    ///
    /// Fails with [`StoreError::Conflict`] if one already exists.
    async fn create_conversation(&self, pair: &ParticipantPair)
        -> Result<Conversation, StoreError>;

    /// Persist a new message in the `Sent` state.
    async fn save_message(&self, message: NewMessage) -> Result<Message, StoreError>;

    /// Find a message by id.
    async fn find_message(&self, id: MessageId) -> Result<Option<Message>, StoreError>;

    /// Advance the targeted messages to `status`.
    ///
    /// Messages already at or past `status` are left untouched. Returns the
    /// messages that actually changed, in conversation order.
    async fn update_message_status(
        &self,
        target: StatusTarget,
        status: MessageStatus,
    ) -> Result<Vec<Message>, StoreError>;

    /// All messages of a conversation in creation order.
    async fn conversation_messages(&self, id: ConversationId) -> Result<Vec<Message>, StoreError>;

    /// The latest message of each conversation `user` takes part in.
    async fn find_last_message_per_conversation(
        &self,
        user: &str,
    ) -> Result<Vec<ConversationSummary>, StoreError>;
}
