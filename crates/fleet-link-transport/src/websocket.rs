//! WebSocket client transport for the control service.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use fleet_link_core::{
    AgentConfig, AnyMessageCallback, ClientBuilder, CredentialsProvider, InboundMessage,
    MessageCallback, OutboundMessage, TransportClient, TransportError,
};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    net::TcpStream,
    sync::{Mutex, watch},
    time::{self, Instant},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Error as WsError, Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::protocol;

/// Upper bound on sending the close frame during teardown.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// WebSocket connection to the control service.
///
/// One client serves one physical connection; after `close` it cannot be
/// reconnected.
pub struct WsClient {
    url: Url,
    credentials: Arc<dyn CredentialsProvider>,
    rw_timeout: Duration,
    handlers: RwLock<HashMap<String, MessageCallback>>,
    any_handler: RwLock<Option<AnyMessageCallback>>,
    writer: Mutex<Option<WsSink>>,
    reader: Mutex<Option<WsSource>>,
    read_deadline: watch::Sender<Instant>,
    closed: CancellationToken,
}

impl WsClient {
    /// Create an unconnected client.
    ///
    /// `http` and `https` endpoints are mapped to `ws` and `wss`.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or has an unsupported scheme.
    pub fn new(
        url: &str,
        credentials: Arc<dyn CredentialsProvider>,
        rw_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let url = websocket_url(url)?;
        let (read_deadline, _) = watch::channel(Instant::now() + rw_timeout);
        Ok(Self {
            url,
            credentials,
            rw_timeout,
            handlers: RwLock::new(HashMap::new()),
            any_handler: RwLock::new(None),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            read_deadline,
            closed: CancellationToken::new(),
        })
    }

    /// Endpoint this client connects to.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// Hand one text frame to the registered callbacks.
    ///
    /// Only a service-reported exception ends the connection; malformed or
    /// unhandled frames are logged and skipped.
    fn dispatch(&self, text: &str) -> Result<(), TransportError> {
        let envelope = match protocol::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Unable to decode message from control service");
                return Ok(());
            }
        };
        if envelope.is_exception() {
            return Err(envelope.into_remote_error());
        }

        let message = InboundMessage::from(envelope);
        let any = self
            .any_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(any) = any {
            any(&message);
        }

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&message.message_type)
            .cloned();
        match handler {
            Some(handler) => handler(&message),
            None => {
                tracing::debug!(message_type = %message.message_type, "No handler for message type");
            }
        }
        Ok(())
    }

    fn release_callbacks(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.any_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[async_trait]
impl TransportClient for WsClient {
    fn add_request_handler(&self, message_type: &str, callback: MessageCallback) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(message_type.to_string(), callback);
    }

    fn set_any_request_handler(&self, callback: AnyMessageCallback) {
        *self
            .any_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    async fn connect(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ClosedLocally);
        }

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let authorization = self
            .credentials
            .authorization()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        if let Some(authorization) = authorization {
            let value = HeaderValue::from_str(&authorization)
                .map_err(|e| TransportError::Connect(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, response) = time::timeout(self.rw_timeout, connect_async(request))
            .await
            .map_err(|_| TransportError::Connect("handshake timed out".to_string()))?
            .map_err(handshake_error)?;
        tracing::debug!(status = %response.status(), url = %self.url.host_str().unwrap_or_default(), "WebSocket handshake complete");

        let (sink, source) = stream.split();
        *self.writer.lock().await = Some(sink);
        *self.reader.lock().await = Some(source);
        self.read_deadline
            .send_replace(Instant::now() + self.rw_timeout);
        Ok(())
    }

    async fn serve(&self) -> Result<(), TransportError> {
        let mut reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or(TransportError::NotConnected)?;

        loop {
            let deadline = *self.read_deadline.borrow();
            let frame = tokio::select! {
                biased;
                () = self.closed.cancelled() => return Err(TransportError::ClosedLocally),
                () = time::sleep_until(deadline) => {
                    // The deadline may have moved while the read was pending
                    if *self.read_deadline.borrow() > deadline {
                        continue;
                    }
                    return Err(TransportError::ReadTimeout);
                }
                frame = reader.next() => frame,
            };

            match frame {
                None => return Err(TransportError::EndOfStream),
                Some(Err(e)) => return Err(stream_error(e)),
                Some(Ok(Message::Text(text))) => self.dispatch(&text)?,
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => self.dispatch(&text)?,
                    Err(e) => tracing::warn!(error = %e, "Dropping non UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(?frame, "Close frame received");
                    return Err(TransportError::EndOfStream);
                }
                Some(Ok(_)) => {}
            }
        }
    }

    async fn write_message(&self, message: OutboundMessage) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ClosedLocally);
        }
        let text = protocol::encode(message)?;

        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(TransportError::NotConnected)?;
        time::timeout(self.rw_timeout, sink.send(Message::Text(text)))
            .await
            .map_err(|_| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "write deadline exceeded",
                ))
            })?
            .map_err(stream_error)
    }

    fn set_read_deadline(&self, deadline: Instant) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::ClosedLocally);
        }
        self.read_deadline.send_replace(deadline);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let first_close = !self.closed.is_cancelled();
        self.closed.cancel();
        self.release_callbacks();

        let sink = self.writer.lock().await.take();
        self.reader.lock().await.take();
        let Some(mut sink) = sink else {
            return Ok(());
        };
        if first_close {
            tracing::debug!("Sending close frame");
            match time::timeout(CLOSE_FRAME_TIMEOUT, sink.close()).await {
                Ok(Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {}
                Ok(Err(e)) => return Err(stream_error(e)),
                Err(_) => tracing::debug!("Timed out sending close frame"),
            }
        }
        Ok(())
    }
}

/// Builds [`WsClient`]s for the session.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsClientBuilder;

impl ClientBuilder for WsClientBuilder {
    fn build(
        &self,
        url: &str,
        _config: &AgentConfig,
        credentials: Arc<dyn CredentialsProvider>,
        rw_timeout: Duration,
    ) -> Result<Arc<dyn TransportClient>, TransportError> {
        let client = WsClient::new(url, credentials, rw_timeout)?;
        Ok(Arc::new(client))
    }
}

fn websocket_url(raw: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(raw).map_err(|e| TransportError::Connect(e.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(TransportError::Connect(format!(
                "Unsupported URL scheme: {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| TransportError::Connect(format!("Unable to use scheme {scheme}")))?;
    Ok(url)
}

/// A rejected handshake carries the service's reason in the response body.
fn handshake_error(err: WsError) -> TransportError {
    match err {
        WsError::Http(response) => {
            let body = response
                .body()
                .as_ref()
                .map(|body| String::from_utf8_lossy(body).trim().to_string())
                .unwrap_or_default();
            if body.is_empty() {
                TransportError::Connect(format!("HTTP {}", response.status()))
            } else {
                TransportError::Rejected(body)
            }
        }
        WsError::Io(e) => TransportError::Io(e),
        other => TransportError::Connect(other.to_string()),
    }
}

fn stream_error(err: WsError) -> TransportError {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::EndOfStream,
        WsError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            TransportError::EndOfStream
        }
        WsError::Io(e) => TransportError::Io(e),
        other => TransportError::Protocol(other.to_string()),
    }
}
