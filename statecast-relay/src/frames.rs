//! Wire frames exchanged with clients
//!
//! Client frames are `{action, token?, key?}` JSON documents. Relay frames are
//! either `{op: ...}` control frames, `{key, snapshot}` on subscribe, or
//! `{key, events, ts}` batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statecast_core::models::{Event, StateRecord};

use crate::connection::ConnectionId;

#[derive(Debug, Deserialize)]
struct RawClientFrame {
    action: Option<String>,
    token: Option<String>,
    key: Option<String>,
}

/// A parsed client → relay frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Auth { token: Option<String> },
    Subscribe { key: String },
    Unsubscribe { key: String },
    Ping,
    /// Unknown action, or a known action missing its required field
    Unknown,
}

impl ClientFrame {
    /// Parse a text frame. Returns `None` if it is not a JSON object.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let frame: RawClientFrame = serde_json::from_str(raw).ok()?;
        let key = frame.key.filter(|key| !key.is_empty());

        let parsed = match (frame.action.as_deref(), key) {
            (Some("auth"), _) => Self::Auth { token: frame.token },
            (Some("subscribe"), Some(key)) => Self::Subscribe { key },
            (Some("unsubscribe"), Some(key)) => Self::Unsubscribe { key },
            (Some("ping"), _) => Self::Ping,
            _ => Self::Unknown,
        };
        Some(parsed)
    }
}

/// Control frames, tagged by `op`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum OpFrame {
    ConnectionAck {
        id: String,
    },
    AuthSuccess,
    AuthFail,
    SubscribeDenied {
        key: String,
    },
    Throttle {
        key: String,
        buffered: usize,
    },
    Pong {
        #[serde(with = "chrono::serde::ts_milliseconds")]
        ts: DateTime<Utc>,
    },
}

impl OpFrame {
    #[must_use]
    pub fn connection_ack(id: ConnectionId) -> Self {
        Self::ConnectionAck { id: id.to_string() }
    }

    #[must_use]
    pub fn pong() -> Self {
        Self::Pong { ts: Utc::now() }
    }
}

/// One flushed batch for a key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFrame {
    pub key: String,
    pub events: Vec<Event>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ts: DateTime<Utc>,
}

/// Any relay → client frame
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Op(OpFrame),
    Snapshot { key: String, snapshot: StateRecord },
    Batch(BatchFrame),
}

impl ServerFrame {
    #[must_use]
    pub fn snapshot(record: StateRecord) -> Self {
        Self::Snapshot {
            key: record.key.clone(),
            snapshot: record,
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<OpFrame> for ServerFrame {
    fn from(frame: OpFrame) -> Self {
        Self::Op(frame)
    }
}

impl From<BatchFrame> for ServerFrame {
    fn from(frame: BatchFrame) -> Self {
        Self::Batch(frame)
    }
}
