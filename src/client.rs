//! Synchronized state client: a reactive value backed by a local replica
//! and reconciled with the session authority over the wire.
//!
//! ```text
//! set()/update() ──► watch value ──► debounce ──► ReplicaStore ──► set msg
//!                        ▲                            │
//!                        │     remote set / snapshot  │ timestamp
//!                        └──── (LWW gate + resolver) ◄┴── transport
//! ```
//!
//! Lifecycle: `start` loads from the replica first and only then begins
//! accepting mutations, so the just-loaded value is never persisted back.
//! Local mutations coalesce through a superseding debounce timer; a save is
//! skipped entirely when the serialized value is byte-identical to the last
//! one persisted. Remote updates pass a last-write-wins gate against the
//! replica's stored timestamp, then a pluggable resolver (prefer-remote by
//! default) picks the value to apply.
//!
//! Background failures (debounced save, remote application) never disturb
//! the reactive value: they are logged and parked in `last_error`. Only
//! [`SyncClient::force_save`] propagates failure to the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::SyncMessage;
use crate::storage::{ReplicaStore, StoreError};
use crate::transport::{ConnectionState, ReconnectingTransport, TransportConfig};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Debounce window for coalescing rapid local mutations (default: 300ms)
    pub debounce: std::time::Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            debounce: std::time::Duration::from_millis(300),
        }
    }
}

impl ClientConfig {
    /// Config with a short debounce for tests.
    pub fn for_testing() -> Self {
        Self {
            debounce: std::time::Duration::from_millis(20),
        }
    }
}

/// Client-facing sync errors.
#[derive(Debug, Clone)]
pub enum SyncError {
    /// Local replica I/O failure
    Storage(StoreError),
    /// Value (de)serialization failure
    Serialization(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Storage(e) => write!(f, "Storage error: {e}"),
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        Self::Storage(e)
    }
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Initial load from the replica completed
    Loaded,
    /// A debounced or forced save persisted and was sent out
    Saved { key: String, timestamp: u64 },
    /// A remote update was applied to the value and the replica
    RemoteApplied { key: String, timestamp: u64 },
    /// A full-snapshot entry was applied
    SnapshotApplied { key: String },
    /// A remote update lost the LWW comparison and was dropped.
    /// Expected behavior, not an error — observable for testing.
    ConflictDiscarded {
        key: String,
        local_timestamp: u64,
        remote_timestamp: u64,
    },
    /// Transport came up
    Online,
    /// Transport went down
    Offline,
}

/// Picks the value to apply when a remote update passes the LWW gate.
/// Arguments are `(local, remote)`; the default returns the remote value.
pub type ConflictResolver<T> = Arc<dyn Fn(&T, &T) -> T + Send + Sync>;

/// Shared adapters for all sync clients in a process: one replica store,
/// one transport, one replica session id. Explicitly constructed and passed
/// to each client — no module-level singletons.
pub struct SyncContext {
    replica: ReplicaStore,
    transport: ReconnectingTransport,
    session_id: String,
}

impl SyncContext {
    /// Connect to `url` with a fresh replica session id.
    pub fn connect(url: impl Into<String>, replica: ReplicaStore) -> Arc<Self> {
        let session_id = Uuid::new_v4().to_string();
        let transport =
            ReconnectingTransport::connect(TransportConfig::new(url, session_id.clone()));
        Arc::new(Self {
            replica,
            transport,
            session_id,
        })
    }

    /// Build from a pre-configured transport (custom backoff, test configs).
    pub fn with_transport(transport: ReconnectingTransport, replica: ReplicaStore) -> Arc<Self> {
        let session_id = transport.session_id().to_string();
        Arc::new(Self {
            replica,
            transport,
            session_id,
        })
    }

    /// This replica's session id, stamped on outbound messages.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The shared local replica.
    pub fn replica(&self) -> &ReplicaStore {
        &self.replica
    }

    /// The shared transport.
    pub fn transport(&self) -> &ReconnectingTransport {
        &self.transport
    }
}

/// Debounce bookkeeping. Each scheduled save bumps the generation; a timer
/// that wakes up to a newer generation has been superseded and does nothing.
struct SaveState {
    generation: u64,
    last_saved: Option<String>,
}

struct ClientShared<T> {
    ctx: Arc<SyncContext>,
    key: String,
    config: ClientConfig,
    resolver: ConflictResolver<T>,
    value_tx: watch::Sender<T>,
    initial_json: Option<String>,
    is_loading: AtomicBool,
    is_saving: AtomicBool,
    initialized: AtomicBool,
    applying_remote: AtomicBool,
    is_online: AtomicBool,
    last_error: Mutex<Option<SyncError>>,
    save_state: Mutex<SaveState>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
}

/// A synchronized, locally durable value for one key of one session.
pub struct SyncClient<T> {
    shared: Arc<ClientShared<T>>,
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<T> SyncClient<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Start a client with the default config and resolver.
    pub fn start(ctx: Arc<SyncContext>, key: impl Into<String>, initial: T) -> Self {
        Self::start_with(ctx, key, initial, ClientConfig::default(), None)
    }

    /// Start a client. Loads from the replica before observing mutations;
    /// call from an async runtime (background tasks are spawned).
    pub fn start_with(
        ctx: Arc<SyncContext>,
        key: impl Into<String>,
        initial: T,
        config: ClientConfig,
        resolver: Option<ConflictResolver<T>>,
    ) -> Self {
        let key = key.into();
        let initial_json = match serde_json::to_string(&initial) {
            Ok(json) => Some(json),
            Err(e) => {
                log::warn!("Initial value for '{key}' not serializable: {e}");
                None
            }
        };
        let (value_tx, _) = watch::channel(initial);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(ClientShared {
            ctx,
            key,
            config,
            resolver: resolver.unwrap_or_else(|| Arc::new(|_local: &T, remote: &T| remote.clone())),
            value_tx,
            initial_json,
            is_loading: AtomicBool::new(true),
            is_saving: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            applying_remote: AtomicBool::new(false),
            is_online: AtomicBool::new(false),
            last_error: Mutex::new(None),
            save_state: Mutex::new(SaveState {
                generation: 0,
                last_saved: None,
            }),
            event_tx,
        });

        // Load before observing, so the loaded value is not persisted back.
        shared.load();
        shared.initialized.store(true, Ordering::SeqCst);
        let _ = shared.event_tx.send(SyncEvent::Loaded);

        let mut tasks = Vec::new();

        // Remote message application.
        {
            let shared = shared.clone();
            let mut inbound = shared.ctx.transport.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    match inbound.recv().await {
                        Ok(msg) => shared.handle_remote(&msg),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Client '{}' lagged {n} inbound messages", shared.key);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }

        // Transport status mirroring.
        {
            let shared = shared.clone();
            let mut state_rx = shared.ctx.transport.subscribe_state();
            tasks.push(tokio::spawn(async move {
                let mut was_online = *state_rx.borrow() == ConnectionState::Connected;
                shared.is_online.store(was_online, Ordering::SeqCst);
                while state_rx.changed().await.is_ok() {
                    let online = *state_rx.borrow() == ConnectionState::Connected;
                    if online != was_online {
                        was_online = online;
                        shared.is_online.store(online, Ordering::SeqCst);
                        let _ = shared.event_tx.send(if online {
                            SyncEvent::Online
                        } else {
                            SyncEvent::Offline
                        });
                    }
                }
            }));
        }

        Self {
            shared,
            event_rx: Some(event_rx),
            tasks,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// The current value.
    pub fn value(&self) -> T {
        self.shared.value_tx.borrow().clone()
    }

    /// Subscribe to value changes. The receiver starts at the current value.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.shared.value_tx.subscribe()
    }

    /// Replace the value and schedule a debounced save.
    pub fn set(&self, value: T) {
        self.shared.value_tx.send_replace(value);
        self.shared.schedule_save();
    }

    /// Transform the value and schedule a debounced save.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = f(&self.shared.value_tx.borrow().clone());
        self.set(next);
    }

    /// Cancel any pending debounce and save now. The one operation whose
    /// failure reaches the caller.
    pub fn force_save(&self) -> Result<(), SyncError> {
        {
            let mut save_state = self.shared.save_state.lock().unwrap();
            save_state.generation += 1;
        }
        self.shared.is_saving.store(true, Ordering::SeqCst);
        let result = self.shared.perform_save();
        self.shared.is_saving.store(false, Ordering::SeqCst);
        if let Err(e) = &result {
            *self.shared.last_error.lock().unwrap() = Some(e.clone());
        }
        result
    }

    /// Reload from the replica. Load failures land in `last_error`.
    pub fn refresh(&self) {
        self.shared.load();
    }

    /// Ask the authority for entries changed after `since` (delta resync).
    pub fn request_changes_since(&self, since: u64) {
        self.shared
            .ctx
            .transport
            .send(SyncMessage::sync_request(since, self.shared.ctx.session_id()));
    }

    /// The key this client synchronizes.
    pub fn key(&self) -> &str {
        &self.shared.key
    }

    /// Whether the initial (or a refresh) load is in progress.
    pub fn is_loading(&self) -> bool {
        self.shared.is_loading.load(Ordering::SeqCst)
    }

    /// Whether a save is pending or in progress.
    pub fn is_saving(&self) -> bool {
        self.shared.is_saving.load(Ordering::SeqCst)
    }

    /// Whether the transport is currently connected.
    pub fn is_online(&self) -> bool {
        self.shared.is_online.load(Ordering::SeqCst)
    }

    /// The most recent background failure, if any.
    pub fn last_error(&self) -> Option<SyncError> {
        self.shared.last_error.lock().unwrap().clone()
    }
}

impl<T> Drop for SyncClient<T> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl<T> ClientShared<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Load the value from the replica. Applies directly to the watch value,
    /// bypassing the save scheduler.
    fn load(self: &Arc<Self>) {
        self.is_loading.store(true, Ordering::SeqCst);

        match self.ctx.replica.get(&self.key) {
            Ok(Some(record)) => match serde_json::from_str::<T>(&record.value) {
                Ok(value) => {
                    self.value_tx.send_replace(value);
                    self.save_state.lock().unwrap().last_saved = Some(record.value);
                }
                Err(e) => {
                    log::warn!("Stored value for '{}' unparsable: {e}", self.key);
                    *self.last_error.lock().unwrap() =
                        Some(SyncError::Serialization(e.to_string()));
                }
            },
            Ok(None) => {
                // Nothing stored: the initial value counts as already saved,
                // so it is not persisted until something actually changes.
                self.save_state.lock().unwrap().last_saved = self.initial_json.clone();
            }
            Err(e) => {
                log::warn!("Load of '{}' from replica failed: {e}", self.key);
                *self.last_error.lock().unwrap() = Some(SyncError::Storage(e));
            }
        }

        self.is_loading.store(false, Ordering::SeqCst);
    }

    /// Schedule a debounced save, superseding any pending one.
    fn schedule_save(self: &Arc<Self>) {
        if self.is_loading.load(Ordering::SeqCst)
            || !self.initialized.load(Ordering::SeqCst)
            || self.applying_remote.load(Ordering::SeqCst)
        {
            return;
        }

        let generation = {
            let mut save_state = self.save_state.lock().unwrap();
            save_state.generation += 1;
            save_state.generation
        };
        self.is_saving.store(true, Ordering::SeqCst);

        let shared = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(shared.config.debounce).await;
            if shared.save_state.lock().unwrap().generation != generation {
                // Superseded by a newer mutation or a force_save.
                return;
            }
            let result = shared.perform_save();
            shared.is_saving.store(false, Ordering::SeqCst);
            if let Err(e) = result {
                log::error!("Debounced save of '{}' failed: {e}", shared.key);
                *shared.last_error.lock().unwrap() = Some(e);
            }
        });
    }

    /// Persist the current value to the replica and send it out. Skips
    /// entirely when the serialized value matches the last one saved.
    fn perform_save(self: &Arc<Self>) -> Result<(), SyncError> {
        let serialized = serde_json::to_string(&*self.value_tx.borrow())
            .map_err(|e| SyncError::Serialization(e.to_string()))?;

        if self.save_state.lock().unwrap().last_saved.as_deref() == Some(serialized.as_str()) {
            return Ok(());
        }

        let timestamp = self.ctx.replica.set(&self.key, &serialized, None)?;
        self.save_state.lock().unwrap().last_saved = Some(serialized.clone());

        self.ctx.transport.send(SyncMessage::set(
            self.key.as_str(),
            serialized,
            timestamp,
            self.ctx.session_id(),
        ));

        self.last_error.lock().unwrap().take();
        let _ = self.event_tx.send(SyncEvent::Saved {
            key: self.key.clone(),
            timestamp,
        });
        Ok(())
    }

    /// Apply one inbound message.
    fn handle_remote(self: &Arc<Self>, msg: &SyncMessage) {
        match msg {
            SyncMessage::Set {
                key,
                value,
                timestamp,
                ..
            } if key == &self.key => {
                self.apply_remote_set(value, *timestamp);
            }

            SyncMessage::SyncChanges { changes, .. } => {
                for change in changes.iter().filter(|c| c.key == self.key) {
                    self.apply_remote_set(&change.value, change.updated_at);
                }
            }

            SyncMessage::SyncResponse { data, .. } => {
                if let Some(value) = data.get(&self.key) {
                    self.apply_snapshot(value);
                }
            }

            // Deletes carry no timestamp to compare against, so the client
            // leaves its value alone; the next save re-publishes it.
            SyncMessage::Delete { key, .. } if key == &self.key => {
                log::debug!("Remote delete of '{}' ignored", self.key);
            }

            SyncMessage::Error { message, .. } => {
                log::warn!("Authority reported: {message}");
            }

            _ => {}
        }
    }

    /// Remote update with a timestamp: LWW gate, then resolver.
    fn apply_remote_set(self: &Arc<Self>, remote_raw: &str, remote_ts: u64) {
        let local = match self.ctx.replica.get(&self.key) {
            Ok(local) => local,
            Err(e) => {
                log::warn!("Replica read for '{}' failed: {e}", self.key);
                None
            }
        };

        if let Some(local) = &local {
            if local.updated_at > remote_ts {
                // Local is newer: drop the update and do not re-broadcast —
                // the next natural local save wins at the authority.
                log::debug!(
                    "Remote update of '{}' at {remote_ts} lost to local {}",
                    self.key,
                    local.updated_at
                );
                let _ = self.event_tx.send(SyncEvent::ConflictDiscarded {
                    key: self.key.clone(),
                    local_timestamp: local.updated_at,
                    remote_timestamp: remote_ts,
                });
                return;
            }
        }

        let remote: T = match serde_json::from_str(remote_raw) {
            Ok(remote) => remote,
            Err(e) => {
                log::warn!("Remote value for '{}' unparsable: {e}", self.key);
                return;
            }
        };

        let chosen = {
            let current = self.value_tx.borrow().clone();
            (self.resolver)(&current, &remote)
        };
        let chosen_raw = match serde_json::to_string(&chosen) {
            Ok(raw) => raw,
            Err(e) => {
                log::error!("Resolved value for '{}' not serializable: {e}", self.key);
                return;
            }
        };

        self.applying_remote.store(true, Ordering::SeqCst);
        self.value_tx.send_replace(chosen);
        self.save_state.lock().unwrap().last_saved = Some(chosen_raw.clone());
        if let Err(e) = self.ctx.replica.set(&self.key, &chosen_raw, Some(remote_ts)) {
            log::error!("Replica write of remote '{}' failed: {e}", self.key);
        }
        self.applying_remote.store(false, Ordering::SeqCst);

        let _ = self.event_tx.send(SyncEvent::RemoteApplied {
            key: self.key.clone(),
            timestamp: remote_ts,
        });
    }

    /// Full-snapshot entry: no per-key timestamp on the wire, applied as-is.
    /// Offline writes flush before the snapshot request goes out, so the
    /// snapshot already reflects them.
    fn apply_snapshot(self: &Arc<Self>, raw: &str) {
        let value: T = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("Snapshot value for '{}' unparsable: {e}", self.key);
                return;
            }
        };

        self.applying_remote.store(true, Ordering::SeqCst);
        self.value_tx.send_replace(value);
        self.save_state.lock().unwrap().last_saved = Some(raw.to_string());
        if let Err(e) = self.ctx.replica.set(&self.key, raw, None) {
            log::error!("Replica write of snapshot '{}' failed: {e}", self.key);
        }
        self.applying_remote.store(false, Ordering::SeqCst);

        let _ = self.event_tx.send(SyncEvent::SnapshotApplied {
            key: self.key.clone(),
        });
    }
}
