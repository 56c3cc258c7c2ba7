//! Session authority: the single source of truth for one session's table.
//!
//! ```text
//! Connection A ──┐
//!                ├── SessionAuthority ── RecordStore (durable)
//! Connection B ──┘         │
//!                          └── ConnectionHub (in-memory only)
//! ```
//!
//! One authority exists per session key, created lazily on first access by
//! the [`SessionRegistry`]. The registry may evict an idle authority from
//! memory ("hibernation"); the record store is durable, so the next access
//! reconstructs the authority over the same directory with no data loss.
//! Only the connection set is in-memory state, and it is rebuilt as sockets
//! reattach — nothing else may be assumed to survive eviction.
//!
//! Messages from all of a session's connections are handled under one
//! operation lock, so no two operations on the same session's store
//! interleave. Different sessions share nothing and run concurrently.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::hub::{ConnectionHub, ConnectionId};
use crate::protocol::{ChangeEntry, SyncMessage};
use crate::storage::{RecordStore, StoreConfig, StoreError};

/// Session keys name store directories, so only path-safe opaque ids are
/// accepted. The embedding router issues them (a cookie uuid, typically).
pub fn is_valid_session_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= 128
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// The authoritative store and message handler for one session.
pub struct SessionAuthority {
    key: String,
    store: RecordStore,
    hub: ConnectionHub,
    /// Serializes message handling for this session.
    op_lock: Mutex<()>,
}

impl SessionAuthority {
    /// Open (or create) the authority's durable store under `dir`.
    pub fn open(key: impl Into<String>, dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let key = key.into();
        let store = RecordStore::open(StoreConfig {
            path: dir.into(),
            ..StoreConfig::default()
        })?;
        log::info!("Session authority '{key}' ready");
        Ok(Self {
            key,
            store,
            hub: ConnectionHub::new(),
            op_lock: Mutex::new(()),
        })
    }

    /// The session key this authority owns.
    pub fn session_key(&self) -> &str {
        &self.key
    }

    /// The live-connection set.
    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    /// Upsert using the client-supplied timestamp when present. Client
    /// timestamps order writes by writer-intent time, which keeps delta
    /// queries and peer conflict resolution consistent with what the writer
    /// believed it wrote.
    pub fn apply_write(
        &self,
        key: &str,
        value: &str,
        timestamp: Option<u64>,
    ) -> Result<u64, StoreError> {
        self.store.set(key, value, timestamp)
    }

    /// Remove the entry immediately. Deletes are not tombstoned: a delete
    /// racing a concurrent set resolves by arrival order, and a delayed set
    /// recreates the key.
    pub fn apply_delete(&self, key: &str) -> Result<(), StoreError> {
        self.store.delete(key)
    }

    /// The full table as a key → value mapping.
    pub fn full_snapshot(&self) -> Result<BTreeMap<String, String>, StoreError> {
        self.store.list_all()
    }

    /// Entries changed strictly after `since`, ascending by `updated_at`.
    pub fn delta_since(&self, since: u64) -> Result<Vec<ChangeEntry>, StoreError> {
        self.store.changed_since(since)
    }

    /// Handle one inbound frame from `conn`.
    ///
    /// Mutations (`set`/`delete`) are applied to the store and then
    /// broadcast exactly once to every *other* live connection; sync queries
    /// are answered on the sending connection only. Malformed input gets an
    /// `error` reply and the connection stays open. Nothing here terminates
    /// the authority.
    pub async fn handle_message(&self, conn: ConnectionId, raw: &str) {
        let _guard = self.op_lock.lock().await;

        let msg = match SyncMessage::decode(raw) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Session '{}': undecodable frame from {conn}: {e}", self.key);
                let reply = SyncMessage::error("Invalid message format");
                let _ = self.hub.send_to(conn, &reply).await;
                return;
            }
        };

        log::debug!("Session '{}': {} from {conn}", self.key, msg.kind());

        match &msg {
            SyncMessage::Set {
                key,
                value,
                timestamp,
                ..
            } => match self.apply_write(key, value, Some(*timestamp)) {
                Ok(_) => {
                    let _ = self.hub.broadcast(&msg, Some(conn)).await;
                }
                Err(e) => {
                    log::error!("Session '{}': write for '{key}' failed: {e}", self.key);
                    let reply = SyncMessage::error("Storage failure");
                    let _ = self.hub.send_to(conn, &reply).await;
                }
            },

            SyncMessage::Delete { key, .. } => match self.apply_delete(key) {
                Ok(()) => {
                    let _ = self.hub.broadcast(&msg, Some(conn)).await;
                }
                Err(e) => {
                    log::error!("Session '{}': delete of '{key}' failed: {e}", self.key);
                    let reply = SyncMessage::error("Storage failure");
                    let _ = self.hub.send_to(conn, &reply).await;
                }
            },

            SyncMessage::Sync { .. } => match self.full_snapshot() {
                Ok(data) => {
                    log::debug!(
                        "Session '{}': snapshot of {} keys to {conn}",
                        self.key,
                        data.len()
                    );
                    let reply = SyncMessage::sync_response(data);
                    let _ = self.hub.send_to(conn, &reply).await;
                }
                Err(e) => {
                    log::error!("Session '{}': snapshot failed: {e}", self.key);
                    let reply = SyncMessage::error("Storage failure");
                    let _ = self.hub.send_to(conn, &reply).await;
                }
            },

            SyncMessage::SyncRequest { since, .. } => match self.delta_since(*since) {
                Ok(changes) => {
                    log::debug!(
                        "Session '{}': {} changes since {since} to {conn}",
                        self.key,
                        changes.len()
                    );
                    let reply = SyncMessage::sync_changes(changes);
                    let _ = self.hub.send_to(conn, &reply).await;
                }
                Err(e) => {
                    log::error!("Session '{}': delta query failed: {e}", self.key);
                    let reply = SyncMessage::error("Storage failure");
                    let _ = self.hub.send_to(conn, &reply).await;
                }
            },

            // Server-to-client kinds arriving at the server are not part of
            // the protocol; ignore them.
            SyncMessage::SyncResponse { .. }
            | SyncMessage::SyncChanges { .. }
            | SyncMessage::Error { .. } => {
                log::debug!(
                    "Session '{}': unexpected {} from {conn}, ignored",
                    self.key,
                    msg.kind()
                );
            }
        }
    }
}

/// Maps session keys to live authorities, creating them lazily and evicting
/// them on hibernation.
pub struct SessionRegistry {
    root: PathBuf,
    sessions: RwLock<HashMap<String, Arc<SessionAuthority>>>,
}

impl SessionRegistry {
    /// A registry storing each session under `root/session-<key>`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Get the live authority for `key`, reconstructing it from its durable
    /// store if it is not in memory.
    pub async fn get_or_open(&self, key: &str) -> Result<Arc<SessionAuthority>, StoreError> {
        if !is_valid_session_key(key) {
            return Err(StoreError::DatabaseError(format!(
                "Invalid session key '{key}'"
            )));
        }

        // Fast path: read lock.
        {
            let sessions = self.sessions.read().await;
            if let Some(authority) = sessions.get(key) {
                return Ok(authority.clone());
            }
        }

        // Slow path: write lock, double-checked.
        let mut sessions = self.sessions.write().await;
        if let Some(authority) = sessions.get(key) {
            return Ok(authority.clone());
        }

        let dir = self.root.join(format!("session-{key}"));
        let authority = Arc::new(SessionAuthority::open(key, dir)?);
        sessions.insert(key.to_string(), authority.clone());
        Ok(authority)
    }

    /// Evict the in-memory authority for `key`. The durable store persists;
    /// the next `get_or_open` reconstructs the authority over it. Intended
    /// for sessions whose last connection has detached.
    pub async fn hibernate(&self, key: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let evicted = sessions.remove(key).is_some();
        if evicted {
            log::info!("Session '{key}' hibernated ({} live)", sessions.len());
        }
        evicted
    }

    /// Number of in-memory authorities.
    pub async fn active_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Keys of in-memory authorities.
    pub async fn active_sessions(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }
}
