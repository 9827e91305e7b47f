use serde::{Deserialize, Serialize};
use statecast_core::models::Event;

/// Envelope for events published on the bus
///
/// Carries the publishing node's id so every node can ignore its own events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub node_id: String,
    pub event: Event,
}

impl BusEnvelope {
    #[must_use]
    pub fn new(node_id: impl Into<String>, event: Event) -> Self {
        Self {
            node_id: node_id.into(),
            event,
        }
    }

    #[must_use]
    pub fn is_from(&self, node_id: &str) -> bool {
        self.node_id == node_id
    }
}
