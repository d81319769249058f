pub mod backoff;
pub mod events;
pub mod metrics;
pub mod queue;
pub mod socket;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bus::EventBus;
use crate::clock::Clock;
use backoff::Backoff;
use events::{validate_event_body, CommandType, FrameKind, GatewayCommand, WireFrame};
use metrics::GatewayMetrics;
use queue::{AckResult, CommandError, CommandQueue, Popped, QueueItem};
use socket::{FrameSink, FrameStream, Inbound, Outbound, SocketFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Identifying,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub url: String,
    /// Bearer token sent in the `identify` command after the socket opens.
    pub link_token: Option<String>,
    pub queue_max_size: usize,
    pub command_max_retries: u32,
    pub command_backoff: Duration,
    pub ack_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub backoff: Backoff,
}

impl GatewayOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            link_token: None,
            queue_max_size: 100,
            command_max_retries: 3,
            command_backoff: Duration::from_millis(500),
            ack_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 10,
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(30)),
        }
    }
}

/// Operator-facing snapshot of a connection.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub state: ConnectionState,
    /// Reconnect attempts since the last successful open.
    pub attempt: u32,
    pub retry_exhausted: bool,
    pub queued: usize,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    QueueFull,
}

impl EnqueueError {
    pub fn code(&self) -> &'static str {
        match self {
            EnqueueError::QueueFull => "QUEUE_FULL",
        }
    }
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::QueueFull => write!(f, "gateway command queue is full"),
        }
    }
}

impl std::error::Error for EnqueueError {}

/// An accepted command. `ack` resolves once upstream acknowledges it or the
/// relay gives up on it; dropping the receiver is fine.
#[derive(Debug)]
pub struct Enqueued {
    pub id: String,
    pub ack: oneshot::Receiver<AckResult>,
}

/// The single logical connection to the upstream event source.
///
/// Cheap to clone; all clones drive the same connection. A background
/// supervisor task owns the socket while the connection is started.
#[derive(Clone)]
pub struct GatewayConnection {
    inner: Arc<Inner>,
}

struct Inner {
    options: GatewayOptions,
    bus: EventBus,
    factory: Arc<dyn SocketFactory>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn GatewayMetrics>,
    queue: Mutex<CommandQueue>,
    in_flight: DashMap<String, InFlight>,
    wake: Notify,
    next_seq: AtomicU64,
    attempt: AtomicU32,
    retry_exhausted: AtomicBool,
    state_tx: watch::Sender<ConnectionState>,
    next_run: AtomicU64,
    supervisor: Mutex<Option<Run>>,
}

/// One supervisor task and the token that stops it. Each `start()` gets its
/// own, so a later start cannot revive a supervisor that is being stopped.
struct Run {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct InFlight {
    item: QueueItem,
    deadline: Instant,
}

enum SessionEnd {
    Stopped,
    Lost(String),
}

enum Write {
    Done,
    Failed(String),
    Cancelled,
}

/// How long the closing frame may take on a stalled socket.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

impl GatewayConnection {
    pub fn new(
        options: GatewayOptions,
        bus: EventBus,
        factory: Arc<dyn SocketFactory>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn GatewayMetrics>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let queue = CommandQueue::new(options.queue_max_size);
        Self {
            inner: Arc::new(Inner {
                options,
                bus,
                factory,
                clock,
                metrics,
                queue: Mutex::new(queue),
                in_flight: DashMap::new(),
                wake: Notify::new(),
                next_seq: AtomicU64::new(0),
                attempt: AtomicU32::new(0),
                retry_exhausted: AtomicBool::new(false),
                state_tx,
                next_run: AtomicU64::new(0),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Begin connecting. No-op while a supervisor is already running; after
    /// [`stop`](Self::stop) or exhausted retries it starts a fresh one.
    pub fn start(&self) {
        let mut slot = self.inner.supervisor();
        if slot.as_ref().is_some_and(|run| !run.handle.is_finished()) {
            tracing::debug!("gateway already running");
            return;
        }

        self.inner.retry_exhausted.store(false, Ordering::SeqCst);
        self.inner.attempt.store(0, Ordering::SeqCst);
        let id = self.inner.next_run.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        tracing::info!(url = %self.inner.options.url, run = id, "starting gateway connection");
        let handle = tokio::spawn(Arc::clone(&self.inner).supervise(id, cancel.clone()));
        *slot = Some(Run { id, cancel, handle });
    }

    /// Tear down the socket and any pending reconnect timer. Idempotent and
    /// safe from any state, including mid-write. Queued commands stay queued
    /// for the next [`start`](Self::start).
    pub async fn stop(&self) {
        let run = self.inner.supervisor().take();
        if let Some(run) = run {
            run.cancel.cancel();
            if let Err(e) = run.handle.await {
                tracing::warn!(run = run.id, "gateway supervisor ended abnormally: {e}");
            }
        }

        // A start() issued while we waited owns the state now.
        let slot = self.inner.supervisor();
        if slot.as_ref().map_or(true, |run| run.handle.is_finished()) {
            self.inner.set_state(ConnectionState::Disconnected);
        }
    }

    /// Queue a command for delivery. Never blocks; a full queue is reported
    /// to the caller and left untouched.
    pub fn enqueue(&self, command: GatewayCommand) -> Result<Enqueued, EnqueueError> {
        let options = &self.inner.options;
        let (tx, rx) = oneshot::channel();
        let item = QueueItem::new(
            self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            command,
            options.command_max_retries,
            options.command_backoff.as_millis() as u64,
            self.inner.clock.now_ms(),
            tx,
        );
        let id = item.id.clone();

        let pushed = self.inner.queue().try_push(item);
        if pushed.is_err() {
            self.inner.metrics.command_rejected_queue_full();
            return Err(EnqueueError::QueueFull);
        }

        self.inner.wake.notify_one();
        Ok(Enqueued { id, ack: rx })
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_retry_exhausted(&self) -> bool {
        self.inner.retry_exhausted.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> GatewayStatus {
        let queued = self.inner.queue().len();
        GatewayStatus {
            state: self.state(),
            attempt: self.inner.attempt.load(Ordering::SeqCst),
            retry_exhausted: self.is_retry_exhausted(),
            queued,
            in_flight: self.inner.in_flight.len(),
        }
    }

    /// The bus inbound events are published to.
    pub fn bus(&self) -> EventBus {
        self.inner.bus.clone()
    }
}

impl Inner {
    fn queue(&self) -> MutexGuard<'_, CommandQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn supervisor(&self) -> MutexGuard<'_, Option<Run>> {
        self.supervisor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        if self.state_tx.send_replace(state) != state {
            self.metrics.state_changed(state);
        }
    }

    /// Only the current supervisor may publish state; a run that has been
    /// taken by `stop()` is silent.
    fn set_run_state(&self, run: u64, state: ConnectionState) {
        let slot = self.supervisor();
        if slot.as_ref().is_some_and(|current| current.id == run) {
            self.set_state(state);
        }
    }

    /// Connect, serve, and reconnect with backoff until stopped or out of
    /// attempts. The only place a reconnect timer exists.
    async fn supervise(self: Arc<Self>, run: u64, cancel: CancellationToken) {
        loop {
            self.set_run_state(run, ConnectionState::Connecting);
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.factory.connect(&self.options.url) => result,
            };

            let end = match connected {
                Ok((sink, stream)) => {
                    self.attempt.store(0, Ordering::SeqCst);
                    self.serve(run, sink, stream, &cancel).await
                }
                Err(e) => SessionEnd::Lost(e.to_string()),
            };
            let reason = match end {
                SessionEnd::Stopped => break,
                SessionEnd::Lost(reason) => reason,
            };
            if cancel.is_cancelled() {
                break;
            }

            let attempt = self.attempt.load(Ordering::SeqCst);
            if attempt >= self.options.max_reconnect_attempts {
                tracing::error!(
                    attempts = attempt,
                    %reason,
                    "gateway reconnect attempts exhausted, staying disconnected until restarted"
                );
                self.set_run_state(run, ConnectionState::Disconnected);
                self.retry_exhausted.store(true, Ordering::SeqCst);
                self.metrics.reconnect_exhausted(attempt);
                break;
            }

            let delay = self.options.backoff.delay_for(attempt);
            self.attempt.store(attempt + 1, Ordering::SeqCst);
            self.set_run_state(run, ConnectionState::Reconnecting);
            tracing::warn!(
                %reason,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "gateway connection lost, reconnecting"
            );
            self.metrics.reconnect_scheduled(attempt + 1, delay);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_run_state(run, ConnectionState::Disconnected);
    }

    async fn serve(
        &self,
        run: u64,
        mut sink: FrameSink,
        mut stream: FrameStream,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        if let Some(token) = self.options.link_token.as_deref() {
            self.set_run_state(run, ConnectionState::Identifying);
            let identify = GatewayCommand::new(
                CommandType::Identify,
                serde_json::json!({ "token": token }),
                self.clock.as_ref(),
            );
            let frame = WireFrame::command(identify.trace_id(), &identify, self.clock.now_ms());
            match self.write(&mut sink, Outbound::Text(frame.to_text()), cancel).await {
                Write::Done => {}
                Write::Failed(reason) => return SessionEnd::Lost(reason),
                Write::Cancelled => {
                    close(&mut sink).await;
                    return SessionEnd::Stopped;
                }
            }
        }

        self.set_run_state(run, ConnectionState::Connected);
        tracing::info!(url = %self.options.url, "gateway connected");

        let mut sweep = tokio::time::interval(
            self.options
                .ack_timeout
                .clamp(Duration::from_millis(10), Duration::from_secs(1)),
        );
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retry_at = None;

        let end = loop {
            if let Err(end) = self.drain(&mut sink, &mut retry_at, cancel).await {
                break end;
            }

            tokio::select! {
                _ = cancel.cancelled() => break SessionEnd::Stopped,
                _ = self.wake.notified() => {}
                _ = sleep_until(retry_at) => {}
                _ = sweep.tick() => self.expire_acks(),
                frame = stream.next() => match frame {
                    Some(Ok(Inbound::Text(text))) => self.handle_frame(&text),
                    Some(Ok(Inbound::Close(code))) => {
                        break SessionEnd::Lost(format!("closed by upstream (code {code:?})"));
                    }
                    Some(Err(e)) => break SessionEnd::Lost(e.to_string()),
                    None => break SessionEnd::Lost("upstream stream ended".to_string()),
                },
            }
        };

        if matches!(end, SessionEnd::Stopped) {
            close(&mut sink).await;
        }
        self.return_in_flight(matches!(end, SessionEnd::Lost(_)));
        end
    }

    /// One socket write. Abandoned on stop; a write that outlasts
    /// `ack_timeout` means the upstream stopped reading.
    async fn write(
        &self,
        sink: &mut FrameSink,
        frame: Outbound,
        cancel: &CancellationToken,
    ) -> Write {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Write::Cancelled,
            sent = tokio::time::timeout(self.options.ack_timeout, sink.send(frame)) => match sent {
                Ok(Ok(())) => Write::Done,
                Ok(Err(e)) => Write::Failed(e.to_string()),
                Err(_) => Write::Failed("socket write timed out".to_string()),
            },
        }
    }

    /// Send every ready queued command, oldest first. Leaves `retry_at` set
    /// when the head is still backing off.
    async fn drain(
        &self,
        sink: &mut FrameSink,
        retry_at: &mut Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<(), SessionEnd> {
        *retry_at = None;
        loop {
            let popped = self.queue().pop_ready(Instant::now());
            let item = match popped {
                Popped::Empty => return Ok(()),
                Popped::Waiting(at) => {
                    *retry_at = Some(at);
                    return Ok(());
                }
                Popped::Ready(item) => item,
            };

            let frame = WireFrame::command(&item.id, &item.command, self.clock.now_ms());
            match self.write(sink, Outbound::Text(frame.to_text()), cancel).await {
                Write::Done => {
                    self.metrics.command_sent(&item.id);
                    let deadline = Instant::now() + self.options.ack_timeout;
                    self.in_flight
                        .insert(item.id.clone(), InFlight { item, deadline });
                }
                Write::Failed(reason) => {
                    self.retry_or_drop(vec![item], CommandError::RetriesExhausted);
                    return Err(SessionEnd::Lost(reason));
                }
                Write::Cancelled => {
                    self.queue().requeue_front(vec![item]);
                    return Err(SessionEnd::Stopped);
                }
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let frame: WireFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "discarding malformed gateway frame");
                self.metrics.frame_rejected("decode");
                return;
            }
        };

        match frame.kind {
            FrameKind::Event => match validate_event_body(frame.data) {
                Ok(body) => {
                    let event = body.into_event(frame.ts);
                    tracing::debug!(
                        event_type = ?event.kind(),
                        trace_id = event.trace_id(),
                        "relaying gateway event"
                    );
                    self.metrics.event_relayed();
                    self.bus.publish(event);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "discarding invalid gateway event");
                    self.metrics.frame_rejected("schema");
                }
            },
            FrameKind::Ack => match frame.request_id.and_then(|id| self.in_flight.remove(&id)) {
                Some((id, in_flight)) => {
                    self.metrics.command_acked(&id);
                    in_flight.item.resolve(Ok(frame.data));
                }
                None => tracing::debug!("ack for unknown or expired command"),
            },
            FrameKind::Error => {
                tracing::warn!(
                    request_id = ?frame.request_id,
                    data = %frame.data,
                    "upstream reported an error"
                );
                if let Some((_, in_flight)) = frame
                    .request_id
                    .as_deref()
                    .and_then(|id| self.in_flight.remove(id))
                {
                    in_flight.item.resolve(Err(CommandError::Rejected(frame.data)));
                }
            }
            FrameKind::Command => tracing::debug!("ignoring command frame from upstream"),
        }
    }

    fn expire_acks(&self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();
        if expired.is_empty() {
            return;
        }

        let items: Vec<QueueItem> = expired
            .iter()
            .filter_map(|id| self.in_flight.remove(id))
            .map(|(_, in_flight)| in_flight.item)
            .collect();
        tracing::debug!(count = items.len(), "gateway commands timed out waiting for ack");
        self.retry_or_drop(items, CommandError::AckTimeout);
    }

    /// Hand unacknowledged commands back to the queue head. A lost socket
    /// counts as a failed attempt; an intentional stop does not.
    fn return_in_flight(&self, count_as_failure: bool) {
        let ids: Vec<String> = self
            .in_flight
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let items: Vec<QueueItem> = ids
            .iter()
            .filter_map(|id| self.in_flight.remove(id))
            .map(|(_, in_flight)| in_flight.item)
            .collect();
        if items.is_empty() {
            return;
        }

        if count_as_failure {
            self.retry_or_drop(items, CommandError::RetriesExhausted);
        } else {
            self.queue().requeue_front(items);
        }
    }

    fn retry_or_drop(&self, items: Vec<QueueItem>, exhausted: CommandError) {
        let now = Instant::now();
        let mut retry = Vec::new();
        for mut item in items {
            if item.record_failure(now) {
                self.metrics.command_retried(&item.id, item.retry_count);
                retry.push(item);
            } else {
                tracing::warn!(
                    command_id = %item.id,
                    trace_id = item.command.trace_id(),
                    retries = item.retry_count,
                    "dropping gateway command after final attempt"
                );
                self.metrics.command_dropped(&item.id, item.retry_count);
                item.resolve(Err(exhausted.clone()));
            }
        }
        if !retry.is_empty() {
            self.queue().requeue_front(retry);
        }
    }
}

async fn close(sink: &mut FrameSink) {
    match tokio::time::timeout(CLOSE_GRACE, sink.send(Outbound::Close)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("close frame not delivered: {e}"),
        Err(_) => tracing::debug!("close frame timed out"),
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
