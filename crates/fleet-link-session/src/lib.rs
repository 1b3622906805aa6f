//! Long-lived, self-healing connection to the fleet control service.
//!
//! Provides:
//! - `Session` - Reconnect loop with backoff and cancellation
//! - Per-connection setup/teardown of handlers and inactivity detection
//! - `session_url` - Connection URL builder
//! - `ConnectionResources` - Client construction and cross-connection state

pub mod connection;
pub mod controller;
pub mod endpoint;
pub mod error;
pub mod handlers;
pub mod resources;
pub mod timer;

#[cfg(test)]
pub(crate) mod testutil;

pub use controller::{Reconnect, Session, SessionParams};
pub use endpoint::{EndpointParams, PROTOCOL_VERSION, session_url};
pub use error::{AttemptError, Disconnect, INACTIVE_INSTANCE_EXCEPTION_PREFIX};
pub use handlers::HandlerSet;
pub use resources::ConnectionResources;
pub use timer::RestartableTimer;
