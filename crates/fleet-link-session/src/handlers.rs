//! The set of message handlers attached to one connection.

use fleet_link_core::{Handler, TransportClient};
use tokio_util::sync::CancellationToken;

/// Handlers belonging to a single physical connection.
///
/// Handlers are kept in registration order (see
/// [`fleet_link_core::HandlerKind`]). Dropping the set cancels the
/// connection's handler token, then stops and clears every handler in
/// reverse order, so nothing leaks into the next connection.
pub struct HandlerSet {
    handlers: Vec<Box<dyn Handler>>,
    cancel: CancellationToken,
}

impl HandlerSet {
    /// Take ownership of a freshly created handler list.
    #[must_use]
    pub fn new(mut handlers: Vec<Box<dyn Handler>>, cancel: CancellationToken) -> Self {
        handlers.sort_by_key(|handler| handler.kind());
        Self { handlers, cancel }
    }

    /// Register every handler's message callbacks with `client`.
    pub fn register(&self, client: &dyn TransportClient) {
        for handler in &self.handlers {
            for (message_type, callback) in handler.message_handlers() {
                tracing::debug!(handler = %handler.kind(), %message_type, "Registering message handler");
                client.add_request_handler(&message_type, callback);
            }
        }
    }

    /// Start every handler.
    pub fn start(&self) {
        for handler in &self.handlers {
            handler.start();
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Drop for HandlerSet {
    fn drop(&mut self) {
        self.cancel.cancel();
        for handler in self.handlers.iter().rev() {
            if let Err(e) = handler.stop() {
                tracing::warn!(handler = %handler.kind(), error = %e, "Failed to stop handler");
            }
            handler.clear_acks();
        }
    }
}
