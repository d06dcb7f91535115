//! # duet-protocol
//!
//! Wire protocol definitions for the Duet direct-messaging engine.
//!
//! This crate defines the events exchanged between Duet clients and the
//! server, the message and conversation records carried inside them, and
//! the codecs used to put them on the wire.
//!
//! ## Events
//!
//! - `user:online` / `users:online` - Presence announcements and broadcasts
//! - `message:send` / `message:new` / `message:sent` - Direct messages
//! - `message:read` / `message:read:receipt` - Read acknowledgements
//! - `typing:start` / `typing:stop` - Typing relay
//!
//! ## Example
//!
//! ```rust
//! use duet_protocol::{codec, ClientEvent};
//!
//! let event: ClientEvent = codec::decode_json(r#"{"event":"user:online","data":"42"}"#).unwrap();
//! assert_eq!(event, ClientEvent::UserOnline("42".to_string()));
//!
//! let encoded = codec::encode(&event).unwrap();
//! let decoded: ClientEvent = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded, event);
//! ```

pub mod codec;
pub mod events;
pub mod records;

pub use codec::{decode, encode, Encoding, ProtocolError};
pub use events::{
    ClientEvent, ErrorNotice, ReadMessages, ReadReceipt, SendMessage, ServerEvent, TypingNotice,
    TypingSignal,
};
pub use records::{
    Conversation, ConversationId, ConversationSummary, Message, MessageId, MessageStatus, UserId,
};
