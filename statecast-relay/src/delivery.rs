use std::sync::Arc;
use tracing::{debug, warn};

use crate::batch::BatchSink;
use crate::connection::{Connection, Outbound, SendStatus};
use crate::connection_manager::ConnectionManager;
use crate::frames::{BatchFrame, OpFrame, ServerFrame};
use crate::hooks::Hooks;
use crate::metrics;

/// Fans a flushed batch out to the key's current subscribers.
///
/// Delivery is at-most-once: a batch a connection cannot afford right now is
/// dropped for that connection, never retried.
#[derive(Clone)]
pub struct Deliverer {
    connections: Arc<ConnectionManager>,
    hooks: Hooks,
}

impl Deliverer {
    #[must_use]
    pub const fn new(connections: Arc<ConnectionManager>, hooks: Hooks) -> Self {
        Self { connections, hooks }
    }

    fn deliver_to(&self, conn: Arc<Connection>, key: &str, payload: &Arc<str>, count: usize) {
        #[allow(clippy::cast_precision_loss)]
        let cost = count.max(1) as f64;

        if !conn.take_tokens(cost) {
            metrics::FRAMES_THROTTLED.inc();
            if conn.take_tokens(0.0) && conn.claim_throttle_notice() {
                self.send_throttle(&conn, key, count);
            }
            debug!(connection_id = %conn.id(), key, events = count, "Batch throttled");
            return;
        }

        if self.hooks.authorizer.is_none() {
            self.send(&conn, Outbound::Text(Arc::clone(payload)));
            return;
        }

        let deliverer = self.clone();
        let key = key.to_string();
        let payload = Arc::clone(payload);
        tokio::spawn(async move {
            if deliverer.hooks.is_authorized(&conn.context(), &key).await {
                deliverer.send(&conn, Outbound::Text(payload));
            } else {
                metrics::FRAMES_DENIED.inc();
                debug!(connection_id = %conn.id(), key, "Batch withheld by authorizer");
            }
        });
    }

    fn send(&self, conn: &Connection, item: Outbound) {
        if self.connections.send(conn, item) == SendStatus::Sent {
            metrics::FRAMES_DELIVERED.inc();
        }
    }

    fn send_throttle(&self, conn: &Connection, key: &str, buffered: usize) {
        let frame = ServerFrame::from(OpFrame::Throttle {
            key: key.to_string(),
            buffered,
        });
        match frame.encode() {
            Ok(text) => {
                self.connections.send(conn, Outbound::Text(text.into()));
            }
            Err(e) => warn!(error = %e, "Failed to encode throttle frame"),
        }
    }
}

impl BatchSink for Deliverer {
    fn deliver(&self, frame: BatchFrame) {
        let subscribers = self.connections.subscribers(&frame.key);
        if subscribers.is_empty() {
            return;
        }

        let count = frame.events.len();
        let key = frame.key.clone();
        let payload: Arc<str> = match ServerFrame::from(frame).encode() {
            Ok(text) => text.into(),
            Err(e) => {
                warn!(key, error = %e, "Failed to encode batch frame");
                return;
            }
        };

        for id in subscribers {
            match self.connections.get(id) {
                Some(conn) if conn.is_open() => self.deliver_to(conn, &key, &payload, count),
                _ => {
                    self.connections.disconnect(id);
                }
            }
        }
    }
}
