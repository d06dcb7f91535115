//! # Duet Server
//!
//! WebSocket front end for the Duet direct-messaging engine.
//!
//! Each connection gets one gateway outbox. Text frames carry JSON events,
//! binary frames carry length-prefixed MessagePack, and replies follow the
//! encoding the client last used.

pub mod config;
pub mod handlers;
pub mod metrics;
