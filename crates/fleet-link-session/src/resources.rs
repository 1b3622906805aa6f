//! Resources that outlive individual connections.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use fleet_link_core::{AgentConfig, ClientBuilder, CredentialsProvider, TransportClient, TransportError};
use url::Url;

/// Builds transport clients and remembers cross-connection state.
pub struct ConnectionResources {
    builder: Arc<dyn ClientBuilder>,
    credentials: Arc<dyn CredentialsProvider>,
    /// True until the first successful connection; never set again.
    send_credentials: AtomicBool,
}

impl ConnectionResources {
    #[must_use]
    pub fn new(builder: Arc<dyn ClientBuilder>, credentials: Arc<dyn CredentialsProvider>) -> Self {
        Self {
            builder,
            credentials,
            send_credentials: AtomicBool::new(true),
        }
    }

    /// Build an unconnected client for `url`.
    ///
    /// # Errors
    /// Returns error if the builder rejects the URL or configuration.
    pub fn create_client(
        &self,
        url: &Url,
        config: &AgentConfig,
    ) -> Result<Arc<dyn TransportClient>, TransportError> {
        self.builder.build(
            url.as_str(),
            config,
            Arc::clone(&self.credentials),
            config.timing.rw_timeout(),
        )
    }

    /// Record a successful connection.
    pub fn connected(&self) {
        if self.send_credentials.swap(false, Ordering::AcqRel) {
            tracing::debug!("First connection established; credentials resend no longer requested");
        }
    }

    /// Value of the `sendCredentials` URL parameter for the next connection.
    #[must_use]
    pub fn send_credentials(&self) -> bool {
        self.send_credentials.load(Ordering::Acquire)
    }
}
