//! Records exchanged between the core and its clients.
//!
//! These are the conversation and message shapes that appear inside
//! outbound events and that the durable store persists.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque user identifier issued by the identity service.
pub type UserId = String;

/// Conversation identifier assigned by the store.
pub type ConversationId = u64;

/// Message identifier assigned by the store.
pub type MessageId = u64;

/// Delivery status of a message.
///
/// Statuses are ordered: a message only ever moves forward through
/// `Sent`, `Delivered`, `Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Persisted, not yet handed to the receiver.
    Sent,
    /// Handed to the receiver's live connection.
    Delivered,
    /// Acknowledged as read by the receiver.
    Read,
}

impl MessageStatus {
    /// Whether moving from `self` to `next` is a forward transition.
    #[must_use]
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        next > self
    }

    /// Whether this is the terminal status.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == MessageStatus::Read
    }

    /// Lowercase name, as it appears on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A two-party conversation.
///
/// `participant_a` always sorts before `participant_b`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub participant_a: UserId,
    pub participant_b: UserId,
}

impl Conversation {
    /// Check whether `user` takes part in this conversation.
    #[must_use]
    pub fn has_participant(&self, user: &str) -> bool {
        self.participant_a == user || self.participant_b == user
    }

    /// The participant that is not `user`, if `user` is a participant.
    #[must_use]
    pub fn other_participant(&self, user: &str) -> Option<&str> {
        if self.participant_a == user {
            Some(&self.participant_b)
        } else if self.participant_b == user {
            Some(&self.participant_a)
        } else {
            None
        }
    }
}

/// A direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Store-assigned identifier.
    pub id: MessageId,
    /// Conversation this message belongs to.
    pub conversation_id: ConversationId,
    /// Position within the conversation, starting at 1.
    pub seq: u64,
    pub sender: UserId,
    pub receiver: UserId,
    pub content: String,
    /// Server-stamped creation time.
    pub created_at: DateTime<Utc>,
    pub status: MessageStatus,
}

/// The most recent message of one of a user's conversations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    /// The other participant.
    pub peer: UserId,
    /// Latest message, if any was ever sent.
    pub last_message: Option<Message>,
}
