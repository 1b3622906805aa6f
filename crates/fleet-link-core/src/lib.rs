//! Core abstractions for the fleet control-plane link.
//!
//! This crate provides the fundamental building blocks:
//! - `Backoff` - Bounded exponential backoff with proportional jitter
//! - `AgentConfig` - Cluster identity, build info and timing knobs
//! - `EventStream` - Best-effort broadcast sink (deregistration notices)
//! - `InboundMessage` / `OutboundMessage` - Untyped protocol messages
//! - Collaborator traits (transport, discovery, engine, handlers)

pub mod backoff;
pub mod config;
pub mod event_stream;
pub mod message;
pub mod traits;

pub use backoff::{Backoff, add_jitter};
pub use config::{AgentConfig, BackoffConfig, BuildInfo, ConfigError, TimingConfig};
pub use event_stream::{EventStream, EventStreamError, InstanceDeregistered};
pub use message::{AnyMessageCallback, InboundMessage, MessageCallback, OutboundMessage};
pub use traits::{
    ClientBuilder, CredentialsError, CredentialsProvider, DiscoveryError, EndpointDiscovery,
    EngineError, Handler, HandlerContext, HandlerError, HandlerFactory, HandlerKind,
    ManifestSeqNum, TransportClient, TransportError, WorkloadEngine,
};
