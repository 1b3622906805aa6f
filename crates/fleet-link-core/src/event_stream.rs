//! Best-effort broadcast event stream.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Default number of undelivered events retained per subscriber.
const CAPACITY: usize = 16;

/// Emitted when the control service reports the managed instance as
/// deregistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDeregistered {
    /// Identity of the instance that is no longer registered.
    pub instance_arn: String,
}

/// Event stream error.
#[derive(Debug, Error)]
pub enum EventStreamError {
    #[error("Event stream {0} is closed")]
    Closed(String),
}

/// Named broadcast sink.
///
/// Writing never blocks. Having no subscribers is not an error; only a
/// closed stream rejects writes. Lagging subscribers lose the oldest events.
pub struct EventStream<T> {
    name: String,
    sender: broadcast::Sender<T>,
    closed: CancellationToken,
}

impl<T: Clone + Send + 'static> EventStream<T> {
    /// Create a new event stream.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(CAPACITY);
        Self {
            name: name.into(),
            sender,
            closed: CancellationToken::new(),
        }
    }

    /// Stream name, used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish an event to every current subscriber.
    ///
    /// # Errors
    /// Returns error if the stream has been closed.
    pub fn write(&self, event: T) -> Result<(), EventStreamError> {
        if self.closed.is_cancelled() {
            return Err(EventStreamError::Closed(self.name.clone()));
        }
        let delivered = self.sender.send(event).unwrap_or(0);
        tracing::debug!(stream = %self.name, delivered, "Event written");
        Ok(())
    }

    /// Get a receiver for events written from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Reject all further writes.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether the stream has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
