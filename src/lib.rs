//! # kvsync — per-session key/value state synchronization
//!
//! Keeps many WebSocket-connected replicas (tabs, devices) eventually
//! consistent with a server-held key/value table, while each replica keeps a
//! local durable cache usable offline.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐      WebSocket       ┌──────────────────┐
//! │ SyncClient   │ ◄──────────────────► │ SessionAuthority │
//! │ (per value)  │     JSON messages    │ (per session)    │
//! └──────┬───────┘                      └───────┬──────────┘
//!        │                                      │
//!        ▼                                      ▼
//! ┌──────────────┐                      ┌──────────────────┐
//! │ ReplicaStore │                      │ RecordStore      │
//! │ (local)      │                      │ (authoritative)  │
//! └──────────────┘                      └───────┬──────────┘
//!                                               │
//!                                       ┌───────┴──────────┐
//!                                       │ ConnectionHub    │
//!                                       │ (sibling fan-out)│
//!                                       └──────────────────┘
//! ```
//!
//! A client mutation updates the reactive value and the local replica, then
//! a debounced `set` travels to the session authority, which applies it to
//! the authoritative store and broadcasts it to every *other* connection on
//! the session. Peers resolve conflicts last-write-wins by timestamp. On
//! (re)connect a client requests a full snapshot, or a delta of everything
//! changed since a known timestamp.
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol (`type`-tagged messages)
//! - [`storage`] — durable record stores (authoritative and replica)
//! - [`hub`] — live-connection set with broadcast-excluding-sender
//! - [`authority`] — per-session authority and hibernation registry
//! - [`server`] — WebSocket accept loop and per-session routing
//! - [`transport`] — reconnecting client transport with offline queue
//! - [`client`] — the synchronized-value client

pub mod authority;
pub mod client;
pub mod hub;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use authority::{SessionAuthority, SessionRegistry};
pub use client::{
    ClientConfig, ConflictResolver, SyncClient, SyncContext, SyncError, SyncEvent,
};
pub use hub::{ConnectionHub, ConnectionId, HubStats};
pub use protocol::{now_millis, ChangeEntry, ProtocolError, SyncMessage};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{Record, RecordStore, ReplicaStore, StoreConfig, StoreError};
pub use transport::{ConnectionState, PendingQueue, ReconnectingTransport, TransportConfig};
