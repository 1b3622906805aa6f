//! Transport layer for the control-plane link.
//!
//! Provides:
//! - Wire envelope (JSON, `type`-tagged)
//! - WebSocket client transport (feature: websocket)

pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use protocol::Envelope;

#[cfg(feature = "websocket")]
pub use websocket::{WsClient, WsClientBuilder};
