//! Wire envelope for control-service messages.
//!
//! Every frame is a JSON object tagged with its message type:
//! `{"type": "HeartbeatMessage", "messageId": "...", ...}`. Fields other than
//! the tag are carried through untouched.

use fleet_link_core::{InboundMessage, OutboundMessage, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Suffix of message types the service uses to report errors.
pub const EXCEPTION_SUFFIX: &str = "Exception";

/// A single JSON frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Whether this frame reports a service-side error.
    #[must_use]
    pub fn is_exception(&self) -> bool {
        self.message_type.ends_with(EXCEPTION_SUFFIX)
    }

    /// Convert an exception frame into the error it reports.
    ///
    /// The error displays as `<Type>: <message>`.
    #[must_use]
    pub fn into_remote_error(self) -> TransportError {
        let message = self
            .payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        TransportError::Remote(format!("{}: {message}", self.message_type))
    }
}

impl From<Envelope> for InboundMessage {
    fn from(envelope: Envelope) -> Self {
        Self {
            message_type: envelope.message_type,
            payload: envelope.payload,
        }
    }
}

impl From<OutboundMessage> for Envelope {
    fn from(message: OutboundMessage) -> Self {
        Self {
            message_type: message.message_type,
            payload: message.payload,
        }
    }
}

/// Parse one text frame.
///
/// # Errors
/// Returns error if the frame is not a JSON object with a string `type`.
pub fn decode(text: &str) -> Result<Envelope, TransportError> {
    serde_json::from_str(text).map_err(|e| TransportError::Protocol(e.to_string()))
}

/// Serialize an outbound message into a text frame.
///
/// # Errors
/// Returns error if the payload cannot be serialized.
pub fn encode(message: OutboundMessage) -> Result<String, TransportError> {
    serde_json::to_string(&Envelope::from(message))
        .map_err(|e| TransportError::Protocol(e.to_string()))
}
