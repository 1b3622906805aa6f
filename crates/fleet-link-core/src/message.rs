//! Untyped protocol messages exchanged over the control-plane connection.
//!
//! The link does not interpret message content. Messages carry their wire
//! type name and the remaining fields as JSON; handlers decode what they own.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Message received from the control service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Wire type name, e.g. `HeartbeatMessage`.
    pub message_type: String,
    /// Every field other than the type tag.
    pub payload: Map<String, Value>,
}

impl InboundMessage {
    /// Create a message with an empty payload.
    #[must_use]
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            payload: Map::new(),
        }
    }

    /// Attach a payload field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Get a string field from the payload.
    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Message sent to the control service (acknowledgments and the like).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Wire type name, e.g. `HeartbeatAckRequest`.
    pub message_type: String,
    /// Every field other than the type tag.
    pub payload: Map<String, Value>,
}

impl OutboundMessage {
    /// Create a message with an empty payload.
    #[must_use]
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            payload: Map::new(),
        }
    }

    /// Attach a payload field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }
}

/// Callback for one registered message type.
pub type MessageCallback = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Callback invoked for every inbound message regardless of type.
pub type AnyMessageCallback = Arc<dyn Fn(&InboundMessage) + Send + Sync>;
