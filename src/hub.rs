//! Live-connection set for one session, with broadcast-excluding-sender
//! fan-out.
//!
//! Connections self-register on WebSocket upgrade and self-deregister on
//! close. The hub holds only each connection's outbound channel sender —
//! all durable state lives in the session's record store, which is what
//! lets the hub be rebuilt from scratch after authority hibernation.
//!
//! Broadcast is best-effort: a send failure on one connection is logged and
//! skipped, never aborting delivery to the rest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, SyncMessage};

/// Identity of one transport-level connection.
pub type ConnectionId = Uuid;

/// Snapshot of hub counters.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub messages_sent: u64,
    pub send_failures: u64,
    pub active_connections: usize,
}

/// Counters tracked via atomics so broadcast never takes a write lock.
struct AtomicHubStats {
    messages_sent: AtomicU64,
    send_failures: AtomicU64,
}

impl AtomicHubStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
        }
    }
}

/// The set of live connections attached to one session authority.
pub struct ConnectionHub {
    connections: RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<Arc<str>>>>,
    stats: AtomicHubStats,
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            stats: AtomicHubStats::new(),
        }
    }

    /// Attach a connection. The sender feeds the connection task's outbound
    /// pump; the hub never queues beyond it.
    pub async fn register(&self, id: ConnectionId, sender: mpsc::UnboundedSender<Arc<str>>) {
        let mut connections = self.connections.write().await;
        connections.insert(id, sender);
        log::debug!("Connection {id} registered ({} live)", connections.len());
    }

    /// Detach a connection. Returns whether it was present.
    pub async fn unregister(&self, id: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        let removed = connections.remove(&id).is_some();
        if removed {
            log::debug!("Connection {id} unregistered ({} live)", connections.len());
        }
        removed
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Whether no connections remain.
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    /// Send `msg` to every live connection except `except`.
    ///
    /// Encodes once; per-connection failures are counted, logged and
    /// skipped. Returns the number of connections the message was handed to.
    pub async fn broadcast(
        &self,
        msg: &SyncMessage,
        except: Option<ConnectionId>,
    ) -> Result<usize, ProtocolError> {
        let encoded: Arc<str> = Arc::from(msg.encode()?);

        let connections = self.connections.read().await;
        let mut delivered = 0;
        for (id, sender) in connections.iter() {
            if Some(*id) == except {
                continue;
            }
            match sender.send(encoded.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    // Receiver gone — the connection task is shutting down
                    // and will unregister itself.
                    self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Broadcast to connection {id} failed, skipping");
                }
            }
        }

        self.stats
            .messages_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);
        Ok(delivered)
    }

    /// Send `msg` to a single connection. Returns false when the connection
    /// is unknown or its channel is closed.
    pub async fn send_to(
        &self,
        id: ConnectionId,
        msg: &SyncMessage,
    ) -> Result<bool, ProtocolError> {
        let encoded: Arc<str> = Arc::from(msg.encode()?);

        let connections = self.connections.read().await;
        match connections.get(&id) {
            Some(sender) => match sender.send(encoded) {
                Ok(()) => {
                    self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                    Ok(true)
                }
                Err(_) => {
                    self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Reply to connection {id} failed, channel closed");
                    Ok(false)
                }
            },
            None => {
                log::debug!("Reply to unknown connection {id} dropped");
                Ok(false)
            }
        }
    }

    /// Counter snapshot.
    pub async fn stats(&self) -> HubStats {
        HubStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            send_failures: self.stats.send_failures.load(Ordering::Relaxed),
            active_connections: self.connections.read().await.len(),
        }
    }
}
