//! Scripted collaborators for session tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use fleet_link_core::{
    AgentConfig, AnyMessageCallback, ClientBuilder, CredentialsProvider, EndpointDiscovery,
    Handler, HandlerContext, HandlerFactory, HandlerKind, InboundMessage, MessageCallback,
    OutboundMessage, TransportClient, TransportError, WorkloadEngine,
    traits::{CredentialsError, DiscoveryError, EngineError, HandlerError},
};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Poll `cond` every virtual millisecond until it holds.
pub async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..100_000 {
        if cond() {
            return;
        }
        time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

pub struct NoCredentials;

#[async_trait]
impl CredentialsProvider for NoCredentials {
    async fn authorization(&self) -> Result<Option<String>, CredentialsError> {
        Ok(None)
    }
}

pub struct MockEngine {
    version: Option<String>,
}

impl MockEngine {
    pub fn new(version: Option<&str>) -> Self {
        Self {
            version: version.map(str::to_string),
        }
    }
}

#[async_trait]
impl WorkloadEngine for MockEngine {
    async fn version(&self) -> Result<String, EngineError> {
        self.version
            .clone()
            .ok_or_else(|| EngineError::Unavailable("not running".into()))
    }
}

pub struct MockDiscovery {
    endpoint: String,
    failures: Mutex<VecDeque<DiscoveryError>>,
    calls: AtomicUsize,
    hangs: bool,
}

impl MockDiscovery {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            failures: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            hangs: false,
        }
    }

    /// Discovery that never answers.
    pub fn hanging() -> Self {
        Self {
            hangs: true,
            ..Self::new("https://acs.example.com")
        }
    }

    pub fn fail_once(self, err: DiscoveryError) -> Self {
        self.failures.lock().unwrap().push_back(err);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EndpointDiscovery for MockDiscovery {
    async fn discover_poll_endpoint(&self, _instance_arn: &str) -> Result<String, DiscoveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hangs {
            std::future::pending::<()>().await;
        }
        match self.failures.lock().unwrap().pop_front() {
            Some(err) => Err(err),
            None => Ok(self.endpoint.clone()),
        }
    }
}

/// How `serve` ends.
#[derive(Debug, Clone)]
pub enum ServeOutcome {
    Clean,
    EndOfStream,
    Fail(String),
    /// Serve until closed; ends with `ClosedLocally`.
    UntilClosed,
}

impl ServeOutcome {
    fn into_result(self) -> Result<(), TransportError> {
        match self {
            Self::Clean => Ok(()),
            Self::EndOfStream => Err(TransportError::EndOfStream),
            Self::Fail(msg) => Err(TransportError::Protocol(msg)),
            Self::UntilClosed => Err(TransportError::ClosedLocally),
        }
    }
}

/// Behavior of one scripted client.
#[derive(Debug, Clone)]
pub struct ClientScript {
    connect_error: Option<String>,
    connect_hangs: bool,
    outcome: ServeOutcome,
    after: Duration,
    heartbeat_every: Option<Duration>,
}

impl ClientScript {
    pub fn serve(outcome: ServeOutcome) -> Self {
        Self {
            connect_error: None,
            connect_hangs: false,
            outcome,
            after: Duration::ZERO,
            heartbeat_every: None,
        }
    }

    /// Connect fails with a server rejection carrying `message`.
    pub fn reject(message: &str) -> Self {
        Self {
            connect_error: Some(message.to_string()),
            ..Self::serve(ServeOutcome::UntilClosed)
        }
    }

    /// Connect never completes.
    pub fn hang_on_connect() -> Self {
        Self {
            connect_hangs: true,
            ..Self::serve(ServeOutcome::UntilClosed)
        }
    }

    /// Serve for `after` before ending with the outcome.
    pub fn after(mut self, after: Duration) -> Self {
        self.after = after;
        self
    }

    /// Deliver a heartbeat every `every` while serving.
    pub fn with_heartbeats(mut self, every: Duration) -> Self {
        self.heartbeat_every = Some(every);
        self
    }
}

pub struct MockClient {
    pub url: String,
    pub rw_timeout: Duration,
    pub built_at: Instant,
    script: ClientScript,
    handlers: Mutex<HashMap<String, MessageCallback>>,
    registered: Mutex<Vec<String>>,
    any_handler: Mutex<Option<AnyMessageCallback>>,
    connects: AtomicUsize,
    closes: AtomicUsize,
    deadline_sets: AtomicUsize,
    closed: CancellationToken,
}

impl MockClient {
    pub fn new(url: &str, outcome: ServeOutcome) -> Self {
        Self::scripted(url, Duration::from_secs(180), ClientScript::serve(outcome))
    }

    fn scripted(url: &str, rw_timeout: Duration, script: ClientScript) -> Self {
        Self {
            url: url.to_string(),
            rw_timeout,
            built_at: Instant::now(),
            script,
            handlers: Mutex::new(HashMap::new()),
            registered: Mutex::new(Vec::new()),
            any_handler: Mutex::new(None),
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            deadline_sets: AtomicUsize::new(0),
            closed: CancellationToken::new(),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn read_deadline_sets(&self) -> usize {
        self.deadline_sets.load(Ordering::SeqCst)
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.registered.lock().unwrap().clone()
    }

    /// Dispatch an inbound message as a real client would.
    pub fn deliver(&self, message: &InboundMessage) {
        let any = self.any_handler.lock().unwrap().clone();
        if let Some(any) = any {
            any(message);
        }
        let typed = self
            .handlers
            .lock()
            .unwrap()
            .get(&message.message_type)
            .cloned();
        if let Some(typed) = typed {
            typed(message);
        }
    }

    async fn run_for(&self, after: Duration) {
        if after.is_zero() {
            return;
        }
        let deadline = Instant::now() + after;
        if let Some(every) = self.script.heartbeat_every {
            while Instant::now() + every <= deadline {
                time::sleep(every).await;
                self.deliver(&InboundMessage::new("HeartbeatMessage"));
            }
        }
        time::sleep_until(deadline).await;
    }
}

#[async_trait]
impl TransportClient for MockClient {
    fn add_request_handler(&self, message_type: &str, callback: MessageCallback) {
        self.registered.lock().unwrap().push(message_type.to_string());
        self.handlers
            .lock()
            .unwrap()
            .insert(message_type.to_string(), callback);
    }

    fn set_any_request_handler(&self, callback: AnyMessageCallback) {
        *self.any_handler.lock().unwrap() = Some(callback);
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.script.connect_hangs {
            std::future::pending::<()>().await;
        }
        match &self.script.connect_error {
            Some(message) => Err(TransportError::Rejected(message.clone())),
            None => Ok(()),
        }
    }

    async fn serve(&self) -> Result<(), TransportError> {
        if self.connects() == 0 {
            return Err(TransportError::NotConnected);
        }
        if matches!(self.script.outcome, ServeOutcome::UntilClosed) {
            self.closed.cancelled().await;
            return Err(TransportError::ClosedLocally);
        }
        tokio::select! {
            () = self.closed.cancelled() => Err(TransportError::ClosedLocally),
            () = self.run_for(self.script.after) => self.script.outcome.clone().into_result(),
        }
    }

    async fn write_message(&self, _message: OutboundMessage) -> Result<(), TransportError> {
        if self.connects() == 0 || self.closed.is_cancelled() {
            return Err(TransportError::NotConnected);
        }
        Ok(())
    }

    fn set_read_deadline(&self, _deadline: Instant) -> Result<(), TransportError> {
        self.deadline_sets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        self.handlers.lock().unwrap().clear();
        self.any_handler.lock().unwrap().take();
        Ok(())
    }
}

/// Hands out scripted clients in order; once the script runs out every
/// client serves until closed.
pub struct ScriptedBuilder {
    scripts: Mutex<VecDeque<ClientScript>>,
    clients: Mutex<Vec<Arc<MockClient>>>,
}

impl ScriptedBuilder {
    pub fn new(scripts: Vec<ClientScript>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            clients: Mutex::new(Vec::new()),
        }
    }

    pub fn clients(&self) -> Vec<Arc<MockClient>> {
        self.clients.lock().unwrap().clone()
    }
}

impl ClientBuilder for ScriptedBuilder {
    fn build(
        &self,
        url: &str,
        _config: &AgentConfig,
        _credentials: Arc<dyn CredentialsProvider>,
        rw_timeout: Duration,
    ) -> Result<Arc<dyn TransportClient>, TransportError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| ClientScript::serve(ServeOutcome::UntilClosed));
        let client = Arc::new(MockClient::scripted(url, rw_timeout, script));
        self.clients.lock().unwrap().push(Arc::clone(&client));
        Ok(client)
    }
}

#[derive(Debug, Default)]
pub struct HandlerCounts {
    starts: AtomicUsize,
    stops: AtomicUsize,
    clears: AtomicUsize,
}

impl HandlerCounts {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

struct CountingHandler {
    kind: HandlerKind,
    counts: Arc<HandlerCounts>,
    events: Arc<Mutex<Vec<String>>>,
    fail_stop: bool,
}

impl CountingHandler {
    fn record(&self, event: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{event}:{}", self.kind));
    }
}

impl Handler for CountingHandler {
    fn kind(&self) -> HandlerKind {
        self.kind
    }

    fn message_handlers(&self) -> Vec<(String, MessageCallback)> {
        self.record("register");
        let callback: MessageCallback = Arc::new(|_: &InboundMessage| {});
        vec![(format!("{}_message", self.kind), callback)]
    }

    fn start(&self) {
        self.record("start");
        self.counts.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) -> Result<(), HandlerError> {
        self.record("stop");
        self.counts.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop {
            return Err(HandlerError::Stop {
                kind: self.kind,
                reason: "stuck".into(),
            });
        }
        Ok(())
    }

    fn clear_acks(&self) {
        self.record("clear");
        self.counts.clears.fetch_add(1, Ordering::SeqCst);
    }
}

/// Creates counting handlers of the given kinds, in the given order.
pub struct CountingFactory {
    kinds: Vec<HandlerKind>,
    failing: Option<HandlerKind>,
    sets: Mutex<Vec<Vec<Arc<HandlerCounts>>>>,
    contexts: Mutex<Vec<HandlerContext>>,
    events: Arc<Mutex<Vec<String>>>,
}

impl CountingFactory {
    pub fn new(kinds: Vec<HandlerKind>) -> Self {
        Self {
            kinds,
            failing: None,
            sets: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing_stop(mut self, kind: HandlerKind) -> Self {
        self.failing = Some(kind);
        self
    }

    pub fn create_boxed(&self) -> Vec<Box<dyn Handler>> {
        let mut counts = Vec::new();
        let handlers = self
            .kinds
            .iter()
            .map(|&kind| {
                let handler_counts = Arc::new(HandlerCounts::default());
                counts.push(Arc::clone(&handler_counts));
                Box::new(CountingHandler {
                    kind,
                    counts: handler_counts,
                    events: Arc::clone(&self.events),
                    fail_stop: self.failing == Some(kind),
                }) as Box<dyn Handler>
            })
            .collect();
        self.sets.lock().unwrap().push(counts);
        handlers
    }

    pub fn sets(&self) -> Vec<Vec<Arc<HandlerCounts>>> {
        self.sets.lock().unwrap().clone()
    }

    pub fn last_set(&self) -> Vec<Arc<HandlerCounts>> {
        self.sets().pop().unwrap_or_default()
    }

    pub fn contexts(&self) -> Vec<HandlerContext> {
        self.contexts.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl HandlerFactory for CountingFactory {
    fn create_handlers(&self, ctx: &HandlerContext) -> Vec<Box<dyn Handler>> {
        self.contexts.lock().unwrap().push(ctx.clone());
        self.create_boxed()
    }
}
