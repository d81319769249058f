#![allow(dead_code)]

use accordrelay::bus::EventBus;
use accordrelay::clock::{Clock, ManualClock};
use accordrelay::gateway::backoff::Backoff;
use accordrelay::gateway::metrics::TracingMetrics;
use accordrelay::gateway::socket::{
    FrameSink, FrameStream, Inbound, Outbound, SocketError, SocketFactory,
};
use accordrelay::gateway::{GatewayConnection, GatewayOptions};
use accordrelay::invite::RoomInviteTokenService;
use accordrelay::routes;
use accordrelay::signature;
use accordrelay::state::AppState;
use axum::body::Body;
use futures_util::future::BoxFuture;
use futures_util::{sink, stream};
use http::{Method, Request};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const WEBHOOK_SECRET: &str = "test-webhook-secret";
pub const ROOM_SECRET: &str = "test-room-secret";
/// 2025-06-15T16:26:40Z
pub const NOW_SECS: u64 = 1_750_004_800;

/// Test server with its own bus, invite service and manual clock.
/// Each instance is isolated, safe for parallel tests.
pub struct TestServer {
    pub state: AppState,
    pub clock: Arc<ManualClock>,
}

impl TestServer {
    /// A relay without an upstream connection.
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_gateway(gateway: GatewayConnection) -> Self {
        Self::build(Some(gateway))
    }

    fn build(gateway: Option<GatewayConnection>) -> Self {
        let clock = Arc::new(ManualClock::new(NOW_SECS * 1000));
        let shared: Arc<dyn Clock> = clock.clone();
        let bus = gateway.as_ref().map(GatewayConnection::bus).unwrap_or_default();
        let state = AppState {
            bus,
            gateway,
            invites: Arc::new(RoomInviteTokenService::new(ROOM_SECRET, Arc::clone(&shared))),
            webhook_secret: Arc::from(WEBHOOK_SECRET.as_bytes()),
            webhook_max_skew_secs: 300,
            clock: shared,
        };
        Self { state, clock }
    }

    /// Returns an Axum Router wired to this server's state for `oneshot()` calls.
    pub fn router(&self) -> axum::Router {
        routes::router(self.state.clone())
    }
}

/// Build a request signed with [`WEBHOOK_SECRET`] at `timestamp`.
pub fn signed_request(uri: &str, timestamp: u64, body: &[u8]) -> Request<Body> {
    let sig = signature::sign(WEBHOOK_SECRET.as_bytes(), timestamp, body);
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("Content-Type", "application/json")
        .header("X-Hub-Timestamp", timestamp.to_string())
        .header("X-Hub-Signature", sig)
        .body(Body::from(body.to_vec()))
        .unwrap()
}

/// Build a JSON request with no signature headers.
pub fn json_request(method: Method, uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Content-Type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

/// Parse a response body as JSON.
pub async fn parse_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ---------------------------------------------------------------------------
// In-memory upstream
// ---------------------------------------------------------------------------

/// The test's end of one accepted connection.
pub struct MockLink {
    /// Frames the relay sent.
    pub sent: mpsc::UnboundedReceiver<Outbound>,
    /// Frames to deliver to the relay. Dropping it ends the stream.
    pub inbound: mpsc::UnboundedSender<Result<Inbound, SocketError>>,
}

impl MockLink {
    pub async fn next_sent(&mut self) -> Outbound {
        self.sent.recv().await.expect("relay closed the link")
    }

    /// Next frame the relay sent, as JSON. Panics on a close frame.
    pub async fn next_json(&mut self) -> serde_json::Value {
        match self.next_sent().await {
            Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
            Outbound::Close => panic!("expected a text frame, got close"),
        }
    }

    pub fn push_text(&self, text: impl Into<String>) {
        self.inbound.send(Ok(Inbound::Text(text.into()))).unwrap();
    }

    pub fn push_json(&self, value: serde_json::Value) {
        self.push_text(value.to_string());
    }

    pub fn close(&self, code: u16) {
        let _ = self.inbound.send(Ok(Inbound::Close(Some(code))));
    }
}

/// Socket factory handing each accepted connection to the test as a
/// [`MockLink`]. Records when every connect attempt happened.
#[derive(Default)]
pub struct MockFactory {
    refuse: AtomicBool,
    attempts: Mutex<Vec<Instant>>,
    links: Mutex<Option<mpsc::UnboundedSender<MockLink>>>,
    accepted: AtomicUsize,
}

impl MockFactory {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockLink>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let factory = Self {
            links: Mutex::new(Some(tx)),
            ..Self::default()
        };
        (Arc::new(factory), rx)
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl SocketFactory for MockFactory {
    fn connect(&self, _url: &str) -> BoxFuture<'static, Result<(FrameSink, FrameStream), SocketError>> {
        self.attempts.lock().unwrap().push(Instant::now());
        if self.refuse.load(Ordering::SeqCst) {
            return Box::pin(async { Err(SocketError::Connect("connection refused".to_string())) });
        }

        let (sent_tx, sent_rx) = mpsc::unbounded_channel::<Outbound>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let link = MockLink {
            sent: sent_rx,
            inbound: inbound_tx,
        };
        if let Some(links) = self.links.lock().unwrap().as_ref() {
            let _ = links.send(link);
        }
        self.accepted.fetch_add(1, Ordering::SeqCst);

        let sink = sink::unfold(sent_tx, |tx, frame: Outbound| async move {
            tx.send(frame)
                .map_err(|_| SocketError::Send("link closed".to_string()))?;
            Ok::<_, SocketError>(tx)
        });
        let stream = stream::unfold(inbound_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        let sink: FrameSink = Box::pin(sink);
        let stream: FrameStream = Box::pin(stream);
        Box::pin(async move { Ok((sink, stream)) })
    }
}

/// Upstream that accepts connections but never reads: every write stays
/// pending forever.
#[derive(Default)]
pub struct StallingFactory {
    connects: AtomicUsize,
    writes_started: Arc<AtomicUsize>,
}

impl StallingFactory {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn writes_started(&self) -> usize {
        self.writes_started.load(Ordering::SeqCst)
    }
}

impl SocketFactory for StallingFactory {
    fn connect(&self, _url: &str) -> BoxFuture<'static, Result<(FrameSink, FrameStream), SocketError>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let writes = Arc::clone(&self.writes_started);
        let sink = sink::unfold((), move |(), _frame: Outbound| {
            writes.fetch_add(1, Ordering::SeqCst);
            async move {
                std::future::pending::<()>().await;
                Ok::<_, SocketError>(())
            }
        });

        let sink: FrameSink = Box::pin(sink);
        let stream: FrameStream = Box::pin(stream::pending::<Result<Inbound, SocketError>>());
        Box::pin(async move { Ok((sink, stream)) })
    }
}

pub fn fast_options() -> GatewayOptions {
    let mut options = GatewayOptions::new("ws://upstream.test/ws");
    options.backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
    options.command_backoff = Duration::from_millis(50);
    options.ack_timeout = Duration::from_millis(200);
    options.max_reconnect_attempts = 5;
    options
}

pub fn gateway(options: GatewayOptions, factory: Arc<dyn SocketFactory>) -> GatewayConnection {
    GatewayConnection::new(
        options,
        EventBus::new(),
        factory,
        Arc::new(ManualClock::new(NOW_SECS * 1000)),
        Arc::new(TracingMetrics),
    )
}

/// Sleep in small steps until `cond` holds. Panics after `limit`.
pub async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in {limit:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
