//! Client-local replica store.
//!
//! A thin wrapper over [`RecordStore`] that is gracefully absent: without a
//! session credential there is nothing to key the local database by, so the
//! replica runs disabled — reads return nothing, writes no-op but still hand
//! back the timestamp they would have stored, and `is_enabled()` reports
//! false. The synchronized value then lives in memory only.

use std::path::Path;

use crate::storage::rocks::{Record, RecordStore, StoreConfig, StoreError};

/// A client-local durable copy of (a subset of) one session's entries.
///
/// Owned exclusively by the sync clients sharing one context; not
/// authoritative — reconciled against the session authority over the wire.
pub struct ReplicaStore {
    store: Option<RecordStore>,
}

impl ReplicaStore {
    /// Open an enabled replica at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        Ok(Self {
            store: Some(RecordStore::open(config)?),
        })
    }

    /// Open a replica keyed by the session credential, under `root`.
    ///
    /// With no credential the replica is disabled rather than an error —
    /// the caller may simply not have a session yet.
    pub fn for_credential(root: &Path, credential: Option<&str>) -> Result<Self, StoreError> {
        match credential {
            Some(credential) => {
                let dir = root.join(format!("replica-{credential}"));
                log::debug!("Opening replica store at {}", dir.display());
                Self::open(StoreConfig {
                    path: dir,
                    ..StoreConfig::default()
                })
            }
            None => {
                log::info!("No session credential - local replica disabled");
                Ok(Self::disabled())
            }
        }
    }

    /// A replica with no backing store.
    pub fn disabled() -> Self {
        Self { store: None }
    }

    /// Whether a backing store is present.
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Fetch the record (value + timestamp) for `key`.
    pub fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
        match &self.store {
            Some(store) => store.get(key),
            None => Ok(None),
        }
    }

    /// Upsert `key`. Returns the stored timestamp; when disabled, returns
    /// the timestamp that would have been stored so callers can still stamp
    /// their outbound messages.
    pub fn set(&self, key: &str, value: &str, timestamp: Option<u64>) -> Result<u64, StoreError> {
        match &self.store {
            Some(store) => store.set(key, value, timestamp),
            None => Ok(timestamp.unwrap_or_else(crate::protocol::now_millis)),
        }
    }

    /// Remove `key`.
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        match &self.store {
            Some(store) => store.delete(key),
            None => Ok(()),
        }
    }
}
