//! # duet-core
//!
//! Presence and message-delivery coordination for the Duet direct-messaging
//! engine.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Presence** - Which users are online, and on which connection
//! - **Conversation** - One conversation per unordered pair of users
//! - **Delivery** - The `Sent -> Delivered -> Read` message state machine
//! - **Typing** - Relay of typing indicators to online receivers
//! - **Gateway** - Binds client events to the components above
//! - **Store** - The persistence contract, with an in-memory implementation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐     ┌─────────┐
//! │  Transport  │────▶│   Gateway   │────▶│   Delivery   │────▶│  Store  │
//! └─────────────┘     └─────────────┘     └──────────────┘     └─────────┘
//!                        │       │               │
//!                        ▼       ▼               ▼
//!                 ┌──────────┐ ┌──────────┐ ┌──────────────┐
//!                 │ Presence │◀│  Typing  │ │ Conversation │
//!                 └──────────┘ └──────────┘ └──────────────┘
//! ```

pub mod connection;
pub mod conversation;
pub mod delivery;
pub mod error;
pub mod gateway;
pub mod memory;
pub mod presence;
pub mod store;
pub mod typing;

pub use connection::ConnectionId;
pub use conversation::{ConversationResolver, ParticipantPair};
pub use delivery::{MessageDelivery, ReadOutcome};
pub use error::CoreError;
pub use gateway::{EventGateway, GatewayConfig, GatewayStats, Outbox};
pub use memory::MemoryStore;
pub use presence::{PresenceChange, PresenceRegistry};
pub use store::{MessageStore, NewMessage, StatusTarget, StoreError};
pub use typing::{Dispatch, TypingRelay};
