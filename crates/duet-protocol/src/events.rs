//! Event types for the Duet protocol.
//!
//! Every frame on the wire is an envelope `{"event": <name>, "data": <payload>}`.
//! Inbound frames decode to [`ClientEvent`], outbound frames encode from
//! [`ServerEvent`].

use crate::records::{ConversationId, Message, UserId};
use serde::{Deserialize, Serialize};

/// Maximum user identifier length.
pub const MAX_USER_ID_LENGTH: usize = 128;

/// Validate a user identifier carried in an inbound payload.
///
/// # Errors
///
/// Returns an error message if the identifier is unusable.
pub fn validate_user_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("user id cannot be empty");
    }
    if id.len() > MAX_USER_ID_LENGTH {
        return Err("user id too long");
    }
    if id.chars().any(char::is_control) {
        return Err("user id contains invalid characters");
    }
    Ok(())
}

/// Payload of `message:send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub content: String,
}

/// Payload of inbound `typing:start` / `typing:stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub sender_id: UserId,
    pub receiver_id: UserId,
}

/// Payload of `message:read`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadMessages {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Identity announcement binding this connection to a user.
    #[serde(rename = "user:online")]
    UserOnline(UserId),

    /// Request for the current online set.
    #[serde(rename = "users:get_online")]
    GetOnlineUsers,

    /// Submit a new direct message.
    #[serde(rename = "message:send")]
    SendMessage(SendMessage),

    /// Sender started typing.
    #[serde(rename = "typing:start")]
    TypingStart(TypingSignal),

    /// Sender stopped typing.
    #[serde(rename = "typing:stop")]
    TypingStop(TypingSignal),

    /// Reader acknowledges every message addressed to them in a conversation.
    #[serde(rename = "message:read")]
    ReadMessages(ReadMessages),
}

impl ClientEvent {
    /// Wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::UserOnline(_) => "user:online",
            ClientEvent::GetOnlineUsers => "users:get_online",
            ClientEvent::SendMessage(_) => "message:send",
            ClientEvent::TypingStart(_) => "typing:start",
            ClientEvent::TypingStop(_) => "typing:stop",
            ClientEvent::ReadMessages(_) => "message:read",
        }
    }

    /// The user this event acts on behalf of, if it names one.
    ///
    /// `user:online` is excluded: it is the announcement that binds an
    /// identity in the first place.
    #[must_use]
    pub fn actor(&self) -> Option<&str> {
        match self {
            ClientEvent::UserOnline(_) | ClientEvent::GetOnlineUsers => None,
            ClientEvent::SendMessage(send) => Some(&send.sender_id),
            ClientEvent::TypingStart(signal) | ClientEvent::TypingStop(signal) => {
                Some(&signal.sender_id)
            }
            ClientEvent::ReadMessages(read) => Some(&read.user_id),
        }
    }

    /// Check that every required field carries a usable value.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), &'static str> {
        match self {
            ClientEvent::UserOnline(user_id) => validate_user_id(user_id),
            ClientEvent::GetOnlineUsers => Ok(()),
            ClientEvent::SendMessage(send) => {
                validate_user_id(&send.sender_id)?;
                validate_user_id(&send.receiver_id)?;
                if send.content.is_empty() {
                    return Err("message content cannot be empty");
                }
                Ok(())
            }
            ClientEvent::TypingStart(signal) | ClientEvent::TypingStop(signal) => {
                validate_user_id(&signal.sender_id)?;
                validate_user_id(&signal.receiver_id)
            }
            ClientEvent::ReadMessages(read) => validate_user_id(&read.user_id),
        }
    }
}

/// Payload of outbound `typing:start` / `typing:stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub sender_id: UserId,
}

/// Payload of `message:read:receipt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub conversation_id: ConversationId,
}

/// Payload of `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub message: String,
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// Current online set.
    #[serde(rename = "users:online")]
    UsersOnline(Vec<UserId>),

    /// A message addressed to this connection's user.
    #[serde(rename = "message:new")]
    NewMessage(Message),

    /// Acknowledgement of a submitted message.
    #[serde(rename = "message:sent")]
    MessageSent(Message),

    /// The peer started typing.
    #[serde(rename = "typing:start")]
    TypingStart(TypingNotice),

    /// The peer stopped typing.
    #[serde(rename = "typing:stop")]
    TypingStop(TypingNotice),

    /// The peer read this user's messages in a conversation.
    #[serde(rename = "message:read:receipt")]
    ReadReceipt(ReadReceipt),

    /// A request from this connection failed.
    #[serde(rename = "error")]
    Error(ErrorNotice),
}

impl ServerEvent {
    /// Wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::UsersOnline(_) => "users:online",
            ServerEvent::NewMessage(_) => "message:new",
            ServerEvent::MessageSent(_) => "message:sent",
            ServerEvent::TypingStart(_) => "typing:start",
            ServerEvent::TypingStop(_) => "typing:stop",
            ServerEvent::ReadReceipt(_) => "message:read:receipt",
            ServerEvent::Error(_) => "error",
        }
    }

    /// Create a new `users:online` event.
    #[must_use]
    pub fn users_online(users: impl IntoIterator<Item = UserId>) -> Self {
        ServerEvent::UsersOnline(users.into_iter().collect())
    }

    /// Create a new `typing:start` event.
    #[must_use]
    pub fn typing_start(sender_id: impl Into<UserId>) -> Self {
        ServerEvent::TypingStart(TypingNotice {
            sender_id: sender_id.into(),
        })
    }

    /// Create a new `typing:stop` event.
    #[must_use]
    pub fn typing_stop(sender_id: impl Into<UserId>) -> Self {
        ServerEvent::TypingStop(TypingNotice {
            sender_id: sender_id.into(),
        })
    }

    /// Create a new `message:read:receipt` event.
    #[must_use]
    pub fn read_receipt(conversation_id: ConversationId) -> Self {
        ServerEvent::ReadReceipt(ReadReceipt { conversation_id })
    }

    /// Create a new `error` event.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorNotice {
            message: message.into(),
        })
    }
}
