use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type emitted for every State Cache mutation
pub const STATE_EVENT: &str = "state";

/// Versioned value stored under a key in the State Cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    pub key: String,
    /// Opaque document supplied by the producer
    pub payload: serde_json::Value,
    /// Starts at 1 and grows by one on every `set` of the same key
    pub version: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

/// A single state change routed through the batch queues
///
/// Events are never mutated after construction; builder methods consume
/// and return a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    #[serde(rename = "ts", with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Set on ingest when the event arrived from a peer instance
    #[serde(skip)]
    pub remote: bool,
}

impl Event {
    #[must_use]
    pub fn new(key: impl Into<String>, kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            kind: kind.into(),
            payload,
            timestamp: Utc::now(),
            priority: None,
            remote: false,
        }
    }

    /// Build the "updated" event for a freshly written record
    #[must_use]
    pub fn from_record(record: &StateRecord) -> Self {
        let payload = serde_json::to_value(record).unwrap_or(serde_json::Value::Null);
        Self::new(record.key.clone(), STATE_EVENT, payload)
    }

    #[must_use]
    pub fn with_priority(self, priority: i32) -> Self {
        Self {
            priority: Some(priority),
            ..self
        }
    }

    #[must_use]
    pub fn into_remote(self) -> Self {
        Self {
            remote: true,
            ..self
        }
    }

    /// Priority used for flush ordering (absent = 0)
    #[must_use]
    pub fn effective_priority(&self) -> i32 {
        self.priority.unwrap_or(0)
    }

    /// Decode the carried record for state events
    #[must_use]
    pub fn record(&self) -> Option<StateRecord> {
        if self.kind != STATE_EVENT {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}
