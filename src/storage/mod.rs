//! Durable storage for session state.
//!
//! ```text
//! ┌──────────────────┐   owns    ┌──────────────────────────────┐
//! │ SessionAuthority │ ────────► │ RecordStore (authoritative)  │
//! └──────────────────┘           │  CF "records" — key → entry  │
//!                                │  CF "changes" — ts index     │
//! ┌──────────────────┐   owns    ├──────────────────────────────┤
//! │ SyncClient(s)    │ ────────► │ ReplicaStore (local mirror)  │
//! └──────────────────┘           └──────────────────────────────┘
//! ```
//!
//! The authoritative store and every client replica share one on-disk
//! layout; only ownership and reconciliation differ. Stores are durable and
//! outlive the processes that open them — the authority reopens the same
//! directory after hibernation, the replica after a page reload.

pub mod replica;
pub mod rocks;

pub use replica::ReplicaStore;
pub use rocks::{Record, RecordStore, StoreConfig, StoreError};
