//! One connection attempt, from endpoint discovery to teardown.

use std::{future::Future, sync::Arc};

use fleet_link_core::{HandlerContext, TransportClient, TransportError, add_jitter};
use tracing::{Instrument, Span};
use uuid::Uuid;

use crate::{
    AttemptError, HandlerSet, RestartableTimer,
    controller::{Session, lock},
    endpoint::{EndpointParams, session_url},
    timer,
};

impl Session {
    /// Run exactly one connection attempt and return its terminal outcome.
    ///
    /// No retries happen here; the controller owns retry policy.
    pub(crate) async fn start_session_once(&self) -> Result<(), AttemptError> {
        let connection_id = Uuid::new_v4();
        self.connect_once()
            .instrument(tracing::info_span!("connection", id = %connection_id))
            .await
    }

    async fn connect_once(&self) -> Result<(), AttemptError> {
        let endpoint = self
            .until_cancelled(self.discovery.discover_poll_endpoint(&self.instance_arn))
            .await?
            .inspect_err(|e| tracing::error!(error = %e, "Unable to discover poll endpoint"))?;

        let engine_version = match self.until_cancelled(self.engine.version()).await? {
            Ok(version) => Some(version),
            Err(e) => {
                tracing::debug!(error = %e, "Workload engine version unavailable");
                None
            }
        };

        let url = session_url(&EndpointParams {
            endpoint: &endpoint,
            cluster: &self.config.cluster,
            instance_arn: &self.instance_arn,
            build: &self.config.build,
            engine_version: engine_version.as_deref(),
            send_credentials: self.resources.send_credentials(),
        })?;
        let client = self.resources.create_client(&url, &self.config)?;

        let result = self.serve_connection(Arc::clone(&client)).await;
        if let Err(e) = client.close().await {
            tracing::debug!(error = %e, "Error closing client");
        }
        result
    }

    /// Await `fut` unless the session is cancelled first.
    async fn until_cancelled<F: Future>(&self, fut: F) -> Result<F::Output, AttemptError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                tracing::info!("Session cancelled before the connection was established");
                Err(AttemptError::Cancelled)
            }
            output = fut => Ok(output),
        }
    }

    /// Wire handlers, connect, and serve until the connection ends or the
    /// session is cancelled. Handlers and timers are released on every exit
    /// path when their owners drop.
    async fn serve_connection(&self, client: Arc<dyn TransportClient>) -> Result<(), AttemptError> {
        let timing = &self.config.timing;
        let ctx = HandlerContext {
            cancel: self.cancel.child_token(),
            cluster: self.config.cluster.clone(),
            instance_arn: self.instance_arn.clone(),
            client: Arc::clone(&client),
            manifest_seq: self.manifest_seq.clone(),
        };
        let handlers = HandlerSet::new(
            self.handler_factory.create_handlers(&ctx),
            ctx.cancel.clone(),
        );
        handlers.register(client.as_ref());
        handlers.start();

        self.until_cancelled(client.connect())
            .await?
            .inspect_err(|e| tracing::error!(error = %e, "Error connecting to control service"))?;
        tracing::info!(handlers = handlers.len(), "Connected to control service endpoint");

        self.resources.connected();
        let inactivity = Arc::new(timer::disconnection_timer(
            Arc::clone(&client),
            timing.heartbeat_timeout,
            timing.heartbeat_jitter,
        ));
        client.set_any_request_handler(timer::any_message_handler(
            Arc::downgrade(&inactivity),
            Arc::downgrade(&client),
            timing,
        ));

        // Only a connection that stays up erases earlier failures.
        let backoff = Arc::clone(&self.backoff);
        let _backoff_reset = RestartableTimer::start(
            add_jitter(timing.heartbeat_timeout, timing.heartbeat_jitter),
            async move {
                tracing::debug!("Connection is durable; resetting reconnect backoff");
                lock(&backoff).reset();
            },
        );

        let serve_client = Arc::clone(&client);
        let mut serve =
            tokio::spawn(async move { serve_client.serve().await }.instrument(Span::current()));

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                tracing::info!("Session exited cleanly");
                serve.abort();
                Err(AttemptError::Cancelled)
            }
            joined = &mut serve => {
                let served = joined.map_err(|e| AttemptError::ServeTask(e.to_string()))?;
                match &served {
                    Ok(()) | Err(TransportError::EndOfStream) => {
                        tracing::info!("Connection closed for a valid reason");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Lost connection with control service");
                    }
                }
                served.map_err(AttemptError::from)
            }
        }
    }
}
