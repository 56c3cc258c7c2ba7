//! Reconnecting WebSocket transport for sync clients.
//!
//! State machine:
//! ```text
//! Connecting ──► Connected ──► (close) ──► Reconnecting ──► Connecting …
//!     │                                        │
//!     └──── (attempt ceiling reached) ◄────────┘
//!                      │
//!                      ▼
//!                   Closed (terminal)
//! ```
//!
//! Backoff is pure exponential: `min(base · 2^(attempt−1), max)`, default
//! base 1 s, cap 30 s, 5 attempts. A normal close (code 1000, or an explicit
//! [`ReconnectingTransport::close`]) never reconnects.
//!
//! While disconnected, `send` appends to an unbounded FIFO queue. On open
//! the counter resets, the queue flushes in order, and a `sync` request goes
//! out to reconcile whatever was missed offline. Inbound frames carrying our
//! own session id are discarded before dispatch — the server already
//! excludes the originating connection, this is the second line of defense.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::SyncMessage;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Server URL including the session key path, e.g. `ws://host:9090/<key>`
    pub url: String,
    /// This replica's session id, stamped on every outbound message
    pub session_id: String,
    /// Consecutive failed attempts before giving up (default: 5)
    pub max_reconnect_attempts: u32,
    /// Backoff base delay (default: 1s)
    pub reconnect_base_delay: Duration,
    /// Backoff ceiling (default: 30s)
    pub reconnect_max_delay: Duration,
    /// Inbound fan-out buffer per subscriber (default: 256)
    pub inbound_capacity: usize,
}

impl TransportConfig {
    pub fn new(url: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            session_id: session_id.into(),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_millis(1000),
            reconnect_max_delay: Duration::from_millis(30_000),
            inbound_capacity: 256,
        }
    }

    /// Config with fast backoff for tests.
    pub fn for_testing(url: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            reconnect_base_delay: Duration::from_millis(20),
            reconnect_max_delay: Duration::from_millis(100),
            ..Self::new(url, session_id)
        }
    }
}

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal: normal close, explicit close, or attempt ceiling reached.
    Closed,
}

/// Unbounded FIFO of messages awaiting a live socket.
pub struct PendingQueue {
    queue: VecDeque<SyncMessage>,
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingQueue {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// Append a message for later flush.
    pub fn enqueue(&mut self, msg: SyncMessage) {
        self.queue.push_back(msg);
    }

    /// Drain all queued messages in FIFO order.
    pub fn drain(&mut self) -> Vec<SyncMessage> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// `min(base · 2^(attempt−1), max)` — `attempt` counts consecutive failures,
/// starting at 1.
fn backoff_delay(config: &TransportConfig, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let delay = config
        .reconnect_base_delay
        .saturating_mul(2u32.saturating_pow(exp));
    delay.min(config.reconnect_max_delay)
}

/// Shared state between the handle and the connection task.
struct TransportShared {
    config: TransportConfig,
    pending: Mutex<PendingQueue>,
    /// Outbound channel of the currently open socket; `None` while down.
    out_tx: Mutex<Option<mpsc::UnboundedSender<SyncMessage>>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
}

impl TransportShared {
    fn set_state(&self, state: ConnectionState) {
        // Subscribers are notified on every transition; a new subscriber
        // sees the current state immediately (watch semantics).
        let _ = self.state_tx.send(state);
    }
}

/// Client-side WebSocket wrapper with reconnection and offline queueing.
pub struct ReconnectingTransport {
    shared: Arc<TransportShared>,
    state_rx: watch::Receiver<ConnectionState>,
    inbound_tx: broadcast::Sender<SyncMessage>,
}

impl ReconnectingTransport {
    /// Start connecting. Returns immediately; the connection loop runs in a
    /// background task until the terminal `Closed` state.
    pub fn connect(config: TransportConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, _) = watch::channel(false);
        let (inbound_tx, _) = broadcast::channel(config.inbound_capacity);

        let shared = Arc::new(TransportShared {
            config,
            pending: Mutex::new(PendingQueue::new()),
            out_tx: Mutex::new(None),
            state_tx,
            shutdown_tx,
        });

        tokio::spawn(Self::run(shared.clone(), inbound_tx.clone()));

        Self {
            shared,
            state_rx,
            inbound_tx,
        }
    }

    /// Send a message: immediately when connected, queued otherwise.
    ///
    /// The pending queue is checked and filled under the same lock the
    /// connection task installs the socket channel under, so a message can
    /// never slip between a queue flush and the channel becoming live.
    pub fn send(&self, msg: SyncMessage) {
        let out_guard = self.shared.out_tx.lock().unwrap();
        let msg = match out_guard.as_ref() {
            Some(tx) => match tx.send(msg) {
                Ok(()) => return,
                Err(err) => err.0,
            },
            None => msg,
        };
        log::debug!("Transport offline, queueing {} message", msg.kind());
        self.shared.pending.lock().unwrap().enqueue(msg);
    }

    /// Subscribe to inbound messages (already filtered for echo).
    pub fn subscribe(&self) -> broadcast::Receiver<SyncMessage> {
        self.inbound_tx.subscribe()
    }

    /// Subscribe to state transitions; the receiver starts at the current
    /// state.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Whether the socket is currently open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// This replica's session id.
    pub fn session_id(&self) -> &str {
        &self.shared.config.session_id
    }

    /// Messages queued while disconnected.
    pub fn pending_len(&self) -> usize {
        self.shared.pending.lock().unwrap().len()
    }

    /// Close normally and stop reconnecting.
    pub fn close(&self) {
        let _ = self.shared.shutdown_tx.send(true);
    }

    async fn run(shared: Arc<TransportShared>, inbound_tx: broadcast::Sender<SyncMessage>) {
        let mut shutdown_rx = shared.shutdown_tx.subscribe();
        let mut attempts: u32 = 0;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            shared.set_state(ConnectionState::Connecting);
            log::debug!(
                "Connecting to {} (attempt {})",
                shared.config.url,
                attempts + 1
            );

            match tokio_tungstenite::connect_async(shared.config.url.as_str()).await {
                Ok((ws_stream, _)) => {
                    attempts = 0;
                    let normal_close =
                        Self::pump(&shared, ws_stream, &inbound_tx, &mut shutdown_rx).await;
                    shared.out_tx.lock().unwrap().take();
                    if normal_close {
                        break;
                    }
                    log::info!("Transport disconnected from {}", shared.config.url);
                }
                Err(e) => {
                    log::warn!("Connect to {} failed: {e}", shared.config.url);
                }
            }

            attempts += 1;
            if attempts >= shared.config.max_reconnect_attempts {
                log::warn!(
                    "Giving up after {attempts} attempts to {}",
                    shared.config.url
                );
                break;
            }

            let delay = backoff_delay(&shared.config, attempts);
            log::info!("Reconnecting to {} in {delay:?}", shared.config.url);
            shared.set_state(ConnectionState::Reconnecting);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        shared.set_state(ConnectionState::Closed);
    }

    /// Pump one open socket until it closes. Returns whether the close was
    /// normal (no reconnection wanted).
    async fn pump(
        shared: &Arc<TransportShared>,
        ws_stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        inbound_tx: &broadcast::Sender<SyncMessage>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SyncMessage>();

        // Flush messages queued while offline, in FIFO order, then ask for a
        // full snapshot to pick up whatever happened while we were away.
        // Held under the out_tx lock so concurrent sends either land in the
        // queue before the drain or go straight to the live channel.
        {
            let mut out_guard = shared.out_tx.lock().unwrap();
            let queued = shared.pending.lock().unwrap().drain();
            if !queued.is_empty() {
                log::info!("Flushing {} queued messages", queued.len());
            }
            for msg in queued {
                let _ = out_tx.send(msg);
            }
            let _ = out_tx.send(SyncMessage::sync(shared.config.session_id.as_str()));
            *out_guard = Some(out_tx);
        }
        shared.set_state(ConnectionState::Connected);
        log::info!("Transport connected to {}", shared.config.url);

        loop {
            tokio::select! {
                outbound = out_rx.recv() => {
                    let Some(msg) = outbound else { return false };
                    let encoded = match msg.encode() {
                        Ok(encoded) => encoded,
                        Err(e) => {
                            log::error!("Dropping unencodable {} message: {e}", msg.kind());
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(encoded.into())).await.is_err() {
                        // Socket went away mid-send; the message is lost like
                        // any in-flight frame. Reconnect and resync.
                        return false;
                    }
                }

                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match SyncMessage::decode(text.as_str()) {
                                Ok(msg) => {
                                    if msg.session_id() == Some(shared.config.session_id.as_str()) {
                                        log::trace!("Dropping echoed {} message", msg.kind());
                                        continue;
                                    }
                                    // No subscribers is fine.
                                    let _ = inbound_tx.send(msg);
                                }
                                Err(e) => {
                                    log::warn!("Undecodable inbound frame: {e}");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = ws_sender.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let normal = frame
                                .as_ref()
                                .map(|f| f.code == CloseCode::Normal)
                                .unwrap_or(false);
                            log::info!("Server closed connection (normal: {normal})");
                            return normal;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error: {e}");
                            return false;
                        }
                        None => return false,
                        _ => {}
                    }
                }

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        return true;
                    }
                }
            }
        }
    }
}

impl Drop for ReconnectingTransport {
    fn drop(&mut self) {
        let _ = self.shared.shutdown_tx.send(true);
    }
}
