//! Session controller: the reconnect loop around single connection attempts.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use fleet_link_core::{
    AgentConfig, Backoff, ClientBuilder, CredentialsProvider, EndpointDiscovery, EventStream,
    HandlerFactory, InstanceDeregistered, ManifestSeqNum, WorkloadEngine,
};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time,
};
use tokio_util::sync::CancellationToken;

use crate::{AttemptError, ConnectionResources, Disconnect};

/// Collaborators a [`Session`] is built from.
pub struct SessionParams {
    pub config: AgentConfig,
    /// Identity of the managed instance.
    pub instance_arn: String,
    pub credentials: Arc<dyn CredentialsProvider>,
    pub discovery: Arc<dyn EndpointDiscovery>,
    pub engine: Arc<dyn WorkloadEngine>,
    pub client_builder: Arc<dyn ClientBuilder>,
    /// Builds the handlers for each new connection. Host-side state the
    /// handlers need (task engine, credentials manager, persisted state)
    /// lives inside the factory.
    pub handler_factory: Arc<dyn HandlerFactory>,
    /// Receives a notice when the instance is found to be deregistered.
    pub deregister_stream: Arc<EventStream<InstanceDeregistered>>,
    /// Last manifest sequence number, shared across connections.
    pub manifest_seq: ManifestSeqNum,
}

/// What the controller does after an attempt ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconnect {
    Immediately,
    After(Duration),
}

/// Long-lived link to the control service.
///
/// [`Session::start`] keeps exactly one connection attempt in flight until
/// the session is cancelled, either through [`Session::stop`] or through the
/// parent token it was created from.
pub struct Session {
    pub(crate) cancel: CancellationToken,
    pub(crate) instance_arn: String,
    pub(crate) config: Arc<AgentConfig>,
    pub(crate) discovery: Arc<dyn EndpointDiscovery>,
    pub(crate) engine: Arc<dyn WorkloadEngine>,
    pub(crate) handler_factory: Arc<dyn HandlerFactory>,
    pub(crate) deregister_stream: Arc<EventStream<InstanceDeregistered>>,
    pub(crate) backoff: Arc<Mutex<Backoff>>,
    pub(crate) resources: ConnectionResources,
    pub(crate) manifest_seq: ManifestSeqNum,
}

impl Session {
    /// Create a session whose lifetime is bounded by `parent`.
    #[must_use]
    pub fn new(parent: &CancellationToken, params: SessionParams) -> Self {
        let backoff = Backoff::from_config(&params.config.timing.backoff);
        Self {
            cancel: parent.child_token(),
            instance_arn: params.instance_arn,
            config: Arc::new(params.config),
            discovery: params.discovery,
            engine: params.engine,
            handler_factory: params.handler_factory,
            deregister_stream: params.deregister_stream,
            backoff: Arc::new(Mutex::new(backoff)),
            resources: ConnectionResources::new(params.client_builder, params.credentials),
            manifest_seq: params.manifest_seq,
        }
    }

    /// Keep connecting to the control service until cancelled.
    ///
    /// Returns only once the session is cancelled. Every other outcome is
    /// absorbed and retried: clean disconnects reconnect at once, a
    /// deregistered instance notifies the deregister stream and waits the
    /// long fixed delay, anything else backs off.
    pub async fn start(&self) {
        // Single slot: a redundant connect signal is dropped, never awaited.
        let (connect_tx, mut connect_rx) = mpsc::channel::<()>(1);
        signal_connect(&connect_tx);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    tracing::info!("Session cancelled; exiting");
                    return;
                }
                Some(()) = connect_rx.recv() => {
                    tracing::debug!("Received connect signal");
                    let result = self.start_session_once().await;
                    if self.cancel.is_cancelled() {
                        tracing::info!("Session cancelled; exiting");
                        return;
                    }

                    match self.reconnect_policy(&result) {
                        Reconnect::Immediately => signal_connect(&connect_tx),
                        Reconnect::After(delay) => {
                            tracing::info!(?delay, "Reconnecting to control service after delay");
                            if self.wait_for_duration(delay).await {
                                tracing::info!("Done waiting; reconnecting to control service");
                                signal_connect(&connect_tx);
                            } else {
                                tracing::info!(
                                    "Interrupted waiting for reconnect delay to elapse; expect session to close"
                                );
                            }
                        }
                    }
                }
            }
        }
    }

    /// Cancel the session and any attempt in flight.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Token cancelled when the session stops.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Decide how to continue after an attempt ended with `result`.
    pub fn reconnect_policy(&self, result: &Result<(), AttemptError>) -> Reconnect {
        let disconnect = Disconnect::classify(result);

        if disconnect == Disconnect::InactiveInstance {
            tracing::debug!("Container instance is deregistered; notifying listeners");
            let event = InstanceDeregistered {
                instance_arn: self.instance_arn.clone(),
            };
            if let Err(e) = self.deregister_stream.write(event) {
                tracing::debug!(error = %e, "Failed to write to deregister instance event stream");
            }
        }

        if disconnect == Disconnect::Clean {
            tracing::info!(outcome = ?result, "Connection closed for a valid reason; reconnecting immediately");
            lock(&self.backoff).reset();
            return Reconnect::Immediately;
        }

        Reconnect::After(self.compute_reconnect_delay(disconnect == Disconnect::InactiveInstance))
    }

    fn compute_reconnect_delay(&self, inactive_instance: bool) -> Duration {
        if inactive_instance {
            return self.config.timing.inactive_instance_reconnect_delay;
        }
        lock(&self.backoff).duration()
    }

    /// Returns false if the wait was interrupted by cancellation.
    async fn wait_for_duration(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            () = time::sleep(delay) => true,
        }
    }

    /// Delays computed since the backoff was last reset.
    #[must_use]
    pub fn backoff_attempts(&self) -> u32 {
        lock(&self.backoff).attempts()
    }
}

pub(crate) fn lock(backoff: &Mutex<Backoff>) -> MutexGuard<'_, Backoff> {
    backoff.lock().unwrap_or_else(PoisonError::into_inner)
}

fn signal_connect(tx: &mpsc::Sender<()>) {
    if let Err(TrySendError::Full(())) = tx.try_send(()) {
        tracing::debug!("Connect already pending; dropping redundant signal");
    }
}
