//! WebSocket sync server with per-session routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!            ├── /<session-key> ── SessionAuthority ── RecordStore
//! Client B ──┘                          │
//!                                       └── ConnectionHub ── fan-out
//! ```
//!
//! The upgrade path carries the session key (`ws://host:port/<key>`) — the
//! embedding router is expected to have issued that key to the client as a
//! durable credential before the socket reaches us. Each connection task
//! pumps inbound frames into its session authority and outbound frames from
//! its hub channel back over the socket.
//!
//! When the last connection of a session detaches, the authority is
//! hibernated: evicted from memory while its record store stays on disk,
//! ready to be reconstructed on the next upgrade for that key.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::authority::{is_valid_session_key, SessionRegistry};
use crate::hub::ConnectionId;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Root directory for per-session record stores
    pub storage_root: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_root: PathBuf::from("kvsync_data"),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_sessions: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.storage_root.clone()));
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Create with an explicit bind address and storage root.
    pub fn with_storage(bind_addr: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_root: root.into(),
        })
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server event loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection for its whole lifetime.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<SessionRegistry>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // The session key is the first path segment of the upgrade URI.
        let mut session_key = String::new();
        let callback = |req: &Request, response: Response| {
            let segment = req
                .uri()
                .path()
                .trim_start_matches('/')
                .split('/')
                .next()
                .unwrap_or("");
            if is_valid_session_key(segment) {
                session_key = segment.to_string();
                Ok(response)
            } else {
                log::warn!("Upgrade from {addr} rejected: no session key in path");
                let mut resp = ErrorResponse::new(Some("Missing session key".to_string()));
                *resp.status_mut() = StatusCode::BAD_REQUEST;
                Err(resp)
            }
        };

        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let authority = match registry.get_or_open(&session_key).await {
            Ok(authority) => authority,
            Err(e) => {
                log::error!("Session '{session_key}' unavailable for {addr}: {e}");
                let _ = ws_sender.send(Message::Close(None)).await;
                return Ok(());
            }
        };

        let conn_id: ConnectionId = Uuid::new_v4();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Arc<str>>();
        authority.hub().register(conn_id, out_tx).await;

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
            s.active_sessions = registry.active_count().await;
        }
        log::info!("Connection {conn_id} from {addr} joined session '{session_key}'");

        loop {
            tokio::select! {
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            authority.handle_message(conn_id, text.as_str()).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection {conn_id} closed from {addr}");
                            break;
                        }
                        Some(Ok(Message::Binary(_))) => {
                            log::debug!("Connection {conn_id}: binary frame ignored");
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error on {conn_id} from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                outbound = out_rx.recv() => {
                    match outbound {
                        Some(text) => {
                            ws_sender.send(Message::Text(text.as_ref().into())).await?;
                        }
                        None => break,
                    }
                }
            }
        }

        // Cleanup: detach, and hibernate the session when it was the last
        // connection. The authority's store is durable; only the connection
        // set dies with us.
        authority.hub().unregister(conn_id).await;
        let session_idle = authority.hub().is_empty().await;
        drop(authority);
        if session_idle {
            registry.hibernate(&session_key).await;
        }

        {
            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_sessions = registry.active_count().await;
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_sessions = self.registry.active_count().await;
        stats
    }

    /// The session registry (for inspection in tests and embedders).
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}
