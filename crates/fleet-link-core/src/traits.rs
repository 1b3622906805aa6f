//! Collaborator contracts for the control-plane link.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{AgentConfig, AnyMessageCallback, MessageCallback, OutboundMessage};

/// Transport error.
///
/// `Rejected` and `Remote` display the server's text verbatim so callers can
/// recognize well-known exception prefixes.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("{0}")]
    Rejected(String),
    #[error("{0}")]
    Remote(String),
    #[error("End of stream")]
    EndOfStream,
    #[error("Connection closed locally")]
    ClosedLocally,
    #[error("Read deadline exceeded")]
    ReadTimeout,
    #[error("Not connected")]
    NotConnected,
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Endpoint discovery error.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Discovery request failed: {0}")]
    RequestFailed(String),
    #[error("{0}")]
    Service(String),
}

/// Workload engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Workload engine unavailable: {0}")]
    Unavailable(String),
}

/// Credentials error.
#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("Credentials unavailable: {0}")]
    Unavailable(String),
}

/// Handler lifecycle error.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Handler {kind} failed to stop: {reason}")]
    Stop { kind: HandlerKind, reason: String },
}

/// Duplex connection to the control service.
///
/// One client serves exactly one physical connection. `serve` returns
/// `Ok(())` or [`TransportError::EndOfStream`] when the remote side closes
/// normally. `close` must be idempotent, must make a running `serve` return,
/// and must release every registered callback.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Register a callback for one message type.
    fn add_request_handler(&self, message_type: &str, callback: MessageCallback);

    /// Register the callback invoked for every inbound message.
    fn set_any_request_handler(&self, callback: AnyMessageCallback);

    /// Open the connection.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Read and dispatch messages until the connection ends.
    async fn serve(&self) -> Result<(), TransportError>;

    /// Send a message over the open connection.
    async fn write_message(&self, message: OutboundMessage) -> Result<(), TransportError>;

    /// Move the read deadline.
    fn set_read_deadline(&self, deadline: Instant) -> Result<(), TransportError>;

    /// Close the connection.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Builds transport clients.
pub trait ClientBuilder: Send + Sync {
    /// Build an unconnected client for `url`.
    ///
    /// # Errors
    /// Returns error if the URL or configuration cannot produce a client.
    fn build(
        &self,
        url: &str,
        config: &AgentConfig,
        credentials: Arc<dyn CredentialsProvider>,
        rw_timeout: Duration,
    ) -> Result<Arc<dyn TransportClient>, TransportError>;
}

/// Resolves the control-service endpoint for an instance.
#[async_trait]
pub trait EndpointDiscovery: Send + Sync {
    async fn discover_poll_endpoint(&self, instance_arn: &str) -> Result<String, DiscoveryError>;
}

/// The local workload engine.
#[async_trait]
pub trait WorkloadEngine: Send + Sync {
    /// Engine runtime version string.
    async fn version(&self) -> Result<String, EngineError>;
}

/// Source of credentials presented when the connection is opened.
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    /// Value for the `Authorization` header, if any.
    async fn authorization(&self) -> Result<Option<String>, CredentialsError>;
}

/// Last task-manifest sequence number seen from the control service.
///
/// Owned by the session and handed to the manifest handler of whichever
/// connection is active. Only one connection is ever active, so there is a
/// single writer at any time; the atomic exists to make sharing sound, not to
/// arbitrate concurrent writers. If connections ever overlap, this needs a
/// real ordering policy.
#[derive(Debug, Clone, Default)]
pub struct ManifestSeqNum(Arc<AtomicI64>);

impl ManifestSeqNum {
    #[must_use]
    pub fn new(value: i64) -> Self {
        Self(Arc::new(AtomicI64::new(value)))
    }

    #[must_use]
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Release);
    }
}

/// Message handler categories, in registration order.
///
/// Credential refresh precedes payload handling so payload processing can
/// request fresh credentials synchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandlerKind {
    RefreshCredentials,
    InstanceAttachment,
    TaskAttachment,
    TaskManifest,
    Payload,
    Heartbeat,
    AgentUpdate,
}

impl HandlerKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RefreshCredentials => "refresh_credentials",
            Self::InstanceAttachment => "instance_attachment",
            Self::TaskAttachment => "task_attachment",
            Self::TaskManifest => "task_manifest",
            Self::Payload => "payload",
            Self::Heartbeat => "heartbeat",
            Self::AgentUpdate => "agent_update",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a handler may use for the lifetime of one connection.
#[derive(Clone)]
pub struct HandlerContext {
    /// Cancelled when the connection is torn down or the session stops.
    pub cancel: CancellationToken,
    pub cluster: String,
    pub instance_arn: String,
    /// Client of the connection the handler is attached to.
    pub client: Arc<dyn TransportClient>,
    pub manifest_seq: ManifestSeqNum,
}

/// Handler for one class of inbound protocol messages.
///
/// A handler instance belongs to exactly one connection. It is registered,
/// started, and finally stopped and cleared exactly once.
pub trait Handler: Send + Sync {
    fn kind(&self) -> HandlerKind;

    /// Message types this handler answers, with their callbacks.
    fn message_handlers(&self) -> Vec<(String, MessageCallback)>;

    fn start(&self);

    /// Stop background work. Must be safe even if `start` never ran.
    ///
    /// # Errors
    /// Returns error if the handler could not shut down cleanly.
    fn stop(&self) -> Result<(), HandlerError>;

    /// Drop acknowledgments still pending for this connection.
    fn clear_acks(&self) {}
}

/// Creates a fresh handler set for each connection.
pub trait HandlerFactory: Send + Sync {
    fn create_handlers(&self, ctx: &HandlerContext) -> Vec<Box<dyn Handler>>;
}
