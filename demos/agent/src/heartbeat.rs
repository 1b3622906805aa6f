//! Acknowledges control-service heartbeats.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
};

use fleet_link_core::{
    Handler, HandlerContext, HandlerError, HandlerKind, InboundMessage, MessageCallback,
    OutboundMessage, TransportClient,
};
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;

const HEARTBEAT_MESSAGE: &str = "HeartbeatMessage";
const HEARTBEAT_ACK: &str = "HeartbeatAckRequest";

/// Message ids waiting to be acknowledged, oldest first.
#[derive(Default)]
struct PendingAcks {
    ids: Mutex<VecDeque<String>>,
    ready: Notify,
}

impl PendingAcks {
    fn push(&self, id: String) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(id);
        self.ready.notify_one();
    }

    fn pop(&self) -> Option<String> {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn clear(&self) -> usize {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = ids.len();
        ids.clear();
        dropped
    }
}

/// Queues an acknowledgment for every heartbeat and sends them in order.
pub struct HeartbeatHandler {
    client: Arc<dyn TransportClient>,
    cancel: CancellationToken,
    pending: Arc<PendingAcks>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatHandler {
    pub fn new(ctx: &HandlerContext) -> Self {
        Self {
            client: Arc::clone(&ctx.client),
            cancel: ctx.cancel.child_token(),
            pending: Arc::new(PendingAcks::default()),
            task: Mutex::new(None),
        }
    }
}

impl Handler for HeartbeatHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Heartbeat
    }

    fn message_handlers(&self) -> Vec<(String, MessageCallback)> {
        let pending = Arc::clone(&self.pending);
        let callback: MessageCallback = Arc::new(move |message: &InboundMessage| {
            match message.str_field("messageId") {
                Some(id) => pending.push(id.to_string()),
                None => tracing::warn!("Heartbeat without messageId"),
            }
        });
        vec![(HEARTBEAT_MESSAGE.to_string(), callback)]
    }

    fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_some() {
            return;
        }
        let client = Arc::clone(&self.client);
        let cancel = self.cancel.clone();
        let pending = Arc::clone(&self.pending);
        *task = Some(tokio::spawn(async move {
            loop {
                while let Some(message_id) = pending.pop() {
                    let ack = OutboundMessage::new(HEARTBEAT_ACK)
                        .with_field("messageId", serde_json::Value::String(message_id));
                    if let Err(e) = client.write_message(ack).await {
                        tracing::warn!(error = %e, "Unable to acknowledge heartbeat");
                    }
                }
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = pending.ready.notified() => {}
                }
            }
        }));
    }

    fn stop(&self) -> Result<(), HandlerError> {
        self.cancel.cancel();
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        Ok(())
    }

    fn clear_acks(&self) {
        let dropped = self.pending.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "Dropped unsent heartbeat acknowledgments");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use fleet_link_core::{AnyMessageCallback, ManifestSeqNum, TransportError};
    use serde_json::json;
    use tokio::{
        sync::mpsc,
        time::{self, Instant},
    };

    use super::*;

    /// Client that forwards every written message to a channel.
    struct RecordingClient {
        written: mpsc::UnboundedSender<OutboundMessage>,
    }

    #[async_trait]
    impl TransportClient for RecordingClient {
        fn add_request_handler(&self, _message_type: &str, _callback: MessageCallback) {}

        fn set_any_request_handler(&self, _callback: AnyMessageCallback) {}

        async fn connect(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn serve(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn write_message(&self, message: OutboundMessage) -> Result<(), TransportError> {
            let _ = self.written.send(message);
            Ok(())
        }

        fn set_read_deadline(&self, _deadline: Instant) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn handler() -> (HeartbeatHandler, MessageCallback, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = HandlerContext {
            cancel: CancellationToken::new(),
            cluster: "c1".into(),
            instance_arn: "arn:1".into(),
            client: Arc::new(RecordingClient { written: tx }),
            manifest_seq: ManifestSeqNum::default(),
        };
        let handler = HeartbeatHandler::new(&ctx);
        let (message_type, callback) = handler.message_handlers().remove(0);
        assert_eq!(message_type, HEARTBEAT_MESSAGE);
        (handler, callback, rx)
    }

    fn heartbeat(id: &str) -> InboundMessage {
        InboundMessage::new(HEARTBEAT_MESSAGE).with_field("messageId", json!(id))
    }

    #[tokio::test]
    async fn test_heartbeat_is_acknowledged_once() {
        let (handler, on_heartbeat, mut written) = handler();
        handler.start();

        on_heartbeat(&heartbeat("m-1"));

        let ack = time::timeout(Duration::from_secs(1), written.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack.message_type, HEARTBEAT_ACK);
        assert_eq!(ack.payload.get("messageId"), Some(&json!("m-1")));
        assert!(time::timeout(Duration::from_millis(50), written.recv()).await.is_err());

        handler.stop().unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_without_id_is_not_acknowledged() {
        let (handler, on_heartbeat, mut written) = handler();
        handler.start();

        on_heartbeat(&InboundMessage::new(HEARTBEAT_MESSAGE));

        assert!(time::timeout(Duration::from_millis(50), written.recv()).await.is_err());
        handler.stop().unwrap();
    }

    #[tokio::test]
    async fn test_clear_acks_drops_queued_acknowledgments() {
        let (handler, on_heartbeat, mut written) = handler();

        on_heartbeat(&heartbeat("m-1"));
        on_heartbeat(&heartbeat("m-2"));
        handler.clear_acks();
        handler.start();

        assert!(time::timeout(Duration::from_millis(50), written.recv()).await.is_err());
        handler.stop().unwrap();
    }
}
