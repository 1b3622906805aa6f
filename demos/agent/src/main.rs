//! Minimal agent that keeps a control-plane session open.
//!
//! Run with: cargo run -p fleet-link-agent-demo -- [config.json]
//!
//! Environment:
//! - `FLEET_LINK_ENDPOINT`: control service endpoint (default `http://127.0.0.1:9000`)
//! - `FLEET_LINK_INSTANCE_ARN`: identity of this instance
//! - `FLEET_LINK_AUTHORIZATION`: optional `Authorization` header value
//! - `FLEET_LINK_CONFIG`: config path, when none is passed as an argument

mod heartbeat;

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use fleet_link_core::{
    AgentConfig, CredentialsError, CredentialsProvider, DiscoveryError, EndpointDiscovery,
    EngineError, EventStream, Handler, HandlerContext, HandlerFactory, InstanceDeregistered,
    ManifestSeqNum, WorkloadEngine,
};
use fleet_link_session::{Session, SessionParams};
use fleet_link_transport::WsClientBuilder;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::heartbeat::HeartbeatHandler;

/// Always answers with the configured endpoint.
struct StaticDiscovery {
    endpoint: String,
}

#[async_trait]
impl EndpointDiscovery for StaticDiscovery {
    async fn discover_poll_endpoint(&self, _instance_arn: &str) -> Result<String, DiscoveryError> {
        Ok(self.endpoint.clone())
    }
}

/// Reads the authorization header from the environment at every handshake.
struct EnvCredentials;

#[async_trait]
impl CredentialsProvider for EnvCredentials {
    async fn authorization(&self) -> Result<Option<String>, CredentialsError> {
        Ok(std::env::var("FLEET_LINK_AUTHORIZATION").ok())
    }
}

/// No local workload engine in the demo.
struct NoEngine;

#[async_trait]
impl WorkloadEngine for NoEngine {
    async fn version(&self) -> Result<String, EngineError> {
        Err(EngineError::Unavailable("no engine configured".to_string()))
    }
}

struct DemoHandlers;

impl HandlerFactory for DemoHandlers {
    fn create_handlers(&self, ctx: &HandlerContext) -> Vec<Box<dyn Handler>> {
        vec![Box::new(HeartbeatHandler::new(ctx))]
    }
}

fn load_config() -> anyhow::Result<AgentConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("FLEET_LINK_CONFIG").ok());
    match path {
        Some(path) => AgentConfig::from_json_file(&path)
            .with_context(|| format!("Failed to load config from {path}")),
        None => {
            let config = AgentConfig::new("default");
            config.validate()?;
            Ok(config)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = load_config()?;
    let endpoint = std::env::var("FLEET_LINK_ENDPOINT")
        .unwrap_or_else(|_| "http://127.0.0.1:9000".to_string());
    let instance_arn = std::env::var("FLEET_LINK_INSTANCE_ARN")
        .unwrap_or_else(|_| "arn:demo:instance/local".to_string());
    tracing::info!(cluster = %config.cluster, %endpoint, %instance_arn, "Starting agent");

    let deregister_stream = Arc::new(EventStream::<InstanceDeregistered>::new("deregister"));
    let mut deregistered = deregister_stream.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = deregistered.recv().await {
            tracing::warn!(instance = %event.instance_arn, "Instance was deregistered");
        }
    });

    let shutdown = CancellationToken::new();
    let session = Session::new(
        &shutdown,
        SessionParams {
            config,
            instance_arn,
            credentials: Arc::new(EnvCredentials),
            discovery: Arc::new(StaticDiscovery { endpoint }),
            engine: Arc::new(NoEngine),
            client_builder: Arc::new(WsClientBuilder),
            handler_factory: Arc::new(DemoHandlers),
            deregister_stream: Arc::clone(&deregister_stream),
            manifest_seq: ManifestSeqNum::default(),
        },
    );

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Unable to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown requested");
        signal_token.cancel();
    });

    session.start().await;
    deregister_stream.close();
    tracing::info!("Agent stopped");
    Ok(())
}
