//! JSON wire protocol for session state synchronization.
//!
//! Messages are JSON text frames with a `type` discriminator:
//! ```text
//! {"type":"set","key":"counter","value":"5","timestamp":1723000000000,"sessionId":"..."}
//! ```
//!
//! | type            | direction      | semantics                                  |
//! |-----------------|----------------|--------------------------------------------|
//! | `set`           | either         | upsert; rebroadcast to sibling connections |
//! | `delete`        | either         | remove; rebroadcast to sibling connections |
//! | `sync`          | client→server  | request a full snapshot                    |
//! | `sync_response` | server→client  | full snapshot reply                        |
//! | `sync_request`  | client→server  | request changes since a timestamp          |
//! | `sync_changes`  | server→client  | delta reply, ascending by `updated_at`     |
//! | `error`         | server→client  | malformed input report                     |
//!
//! `sessionId` identifies the *writer replica*, not the server-side session
//! boundary; both ends drop inbound messages carrying their own id.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch. All protocol and store timestamps use
/// this clock unless a caller timestamp is supplied.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One row of a delta reply: an entry changed after the requested timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub key: String,
    pub value: String,
    pub updated_at: u64,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Upsert a key. Broadcast to every sibling connection on receipt.
    Set {
        key: String,
        value: String,
        timestamp: u64,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Remove a key. Broadcast to every sibling connection on receipt.
    Delete {
        key: String,
        timestamp: u64,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Request a full snapshot of the session table.
    Sync {
        timestamp: u64,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Full snapshot reply, sent only to the requesting connection.
    SyncResponse {
        data: BTreeMap<String, String>,
        timestamp: u64,
    },
    /// Request entries changed strictly after `since`.
    SyncRequest {
        since: u64,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Delta reply, ascending by `updated_at`.
    SyncChanges {
        changes: Vec<ChangeEntry>,
        timestamp: u64,
    },
    /// Malformed-input report. The connection stays open.
    Error { message: String, timestamp: u64 },
}

impl SyncMessage {
    /// Create a `set` message carrying the writer's replica id.
    pub fn set(
        key: impl Into<String>,
        value: impl Into<String>,
        timestamp: u64,
        session_id: impl Into<String>,
    ) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
            timestamp,
            session_id: session_id.into(),
        }
    }

    /// Create a `delete` message.
    pub fn delete(key: impl Into<String>, timestamp: u64, session_id: impl Into<String>) -> Self {
        Self::Delete {
            key: key.into(),
            timestamp,
            session_id: session_id.into(),
        }
    }

    /// Create a full-snapshot request stamped with the current time.
    pub fn sync(session_id: impl Into<String>) -> Self {
        Self::Sync {
            timestamp: now_millis(),
            session_id: session_id.into(),
        }
    }

    /// Create a full-snapshot reply.
    pub fn sync_response(data: BTreeMap<String, String>) -> Self {
        Self::SyncResponse {
            data,
            timestamp: now_millis(),
        }
    }

    /// Create a delta request for entries changed after `since`.
    pub fn sync_request(since: u64, session_id: impl Into<String>) -> Self {
        Self::SyncRequest {
            since,
            session_id: session_id.into(),
        }
    }

    /// Create a delta reply.
    pub fn sync_changes(changes: Vec<ChangeEntry>) -> Self {
        Self::SyncChanges {
            changes,
            timestamp: now_millis(),
        }
    }

    /// Create a malformed-input report.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            timestamp: now_millis(),
        }
    }

    /// The writer replica id, for the kinds that carry one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Set { session_id, .. }
            | Self::Delete { session_id, .. }
            | Self::Sync { session_id, .. }
            | Self::SyncRequest { session_id, .. } => Some(session_id),
            Self::SyncResponse { .. } | Self::SyncChanges { .. } | Self::Error { .. } => None,
        }
    }

    /// Wire name of this message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Set { .. } => "set",
            Self::Delete { .. } => "delete",
            Self::Sync { .. } => "sync",
            Self::SyncResponse { .. } => "sync_response",
            Self::SyncRequest { .. } => "sync_request",
            Self::SyncChanges { .. } => "sync_changes",
            Self::Error { .. } => "error",
        }
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the JSON wire form.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
