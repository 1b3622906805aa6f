//! Restartable one-shot timer and connection inactivity detection.

use std::{
    future::Future,
    sync::{Arc, Weak},
    time::Duration,
};

use fleet_link_core::{
    AnyMessageCallback, InboundMessage, TimingConfig, TransportClient, add_jitter,
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, Instant},
};

/// One-shot timer whose deadline can be pushed back until it fires.
///
/// The action runs at most once. Stopping or dropping the timer cancels it
/// only before it fires; a fired action runs to completion on its own task.
pub struct RestartableTimer {
    deadline: watch::Sender<Instant>,
    task: JoinHandle<()>,
}

impl RestartableTimer {
    /// Arm a timer that runs `on_fire` after `after` unless reset or stopped.
    pub fn start<F>(after: Duration, on_fire: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (deadline, mut rx) = watch::channel(Instant::now() + after);
        let task = tokio::spawn(async move {
            loop {
                let current = *rx.borrow_and_update();
                tokio::select! {
                    () = time::sleep_until(current) => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
            tokio::spawn(on_fire);
        });
        Self { deadline, task }
    }

    /// Move the deadline to `after` from now.
    ///
    /// Returns false if the timer already fired or was stopped.
    pub fn reset(&self, after: Duration) -> bool {
        if self.task.is_finished() {
            return false;
        }
        self.deadline.send_replace(Instant::now() + after);
        true
    }

    /// Cancel the timer.
    pub fn stop(&self) {
        self.task.abort();
    }

    /// Whether the timer fired or was stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RestartableTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Timer that closes `client` when the connection stays silent too long.
pub fn disconnection_timer(
    client: Arc<dyn TransportClient>,
    timeout: Duration,
    jitter: Duration,
) -> RestartableTimer {
    RestartableTimer::start(add_jitter(timeout, jitter), async move {
        tracing::warn!("Connection hasn't had any activity for too long; closing connection");
        if let Err(e) = client.close().await {
            tracing::warn!(error = %e, "Error disconnecting");
        }
        tracing::info!("Disconnected from control service");
    })
}

/// Callback for every inbound message: any traffic proves the connection is
/// alive, so extend the read deadline and push back the disconnection timer.
///
/// Holds weak references so the client's callback table does not keep the
/// timer or the client itself alive.
pub fn any_message_handler(
    timer: Weak<RestartableTimer>,
    client: Weak<dyn TransportClient>,
    timing: &TimingConfig,
) -> AnyMessageCallback {
    let heartbeat_timeout = timing.heartbeat_timeout;
    let heartbeat_jitter = timing.heartbeat_jitter;
    let rw_timeout = timing.rw_timeout();
    Arc::new(move |_: &InboundMessage| {
        tracing::debug!("Control service activity occurred");
        if let Some(client) = client.upgrade() {
            if let Err(e) = client.set_read_deadline(Instant::now() + rw_timeout) {
                tracing::warn!(error = %e, "Unable to extend read deadline");
            }
        }
        if let Some(timer) = timer.upgrade() {
            timer.reset(add_jitter(heartbeat_timeout, heartbeat_jitter));
        }
    })
}
