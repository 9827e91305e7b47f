use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionId, ConnectionLimits, Outbound, SendStatus};
use crate::metrics;
use crate::registry::SubscriptionRegistry;

/// Connection manager for tracking live connections and their subscriptions
///
/// A connection and its subscription edges are removed together: once
/// `disconnect` returns, no edge of that connection is left and no later
/// `subscribe` for it can succeed.
pub struct ConnectionManager {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    registry: SubscriptionRegistry,
    limits: ConnectionLimits,
    outbound_buffer: usize,
    total_connections: AtomicU64,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(limits: ConnectionLimits, outbound_buffer: usize) -> Self {
        Self {
            connections: DashMap::new(),
            registry: SubscriptionRegistry::new(),
            limits,
            outbound_buffer: outbound_buffer.max(1),
            total_connections: AtomicU64::new(0),
        }
    }

    /// Register a new connection and hand back the receiving end of its
    /// outbound queue
    pub fn register(&self, authenticated: bool) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(self.outbound_buffer);
        let conn = Arc::new(Connection::new(
            ConnectionId::new(),
            tx,
            authenticated,
            self.limits,
        ));

        self.connections.insert(conn.id(), Arc::clone(&conn));
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        metrics::ACTIVE_CONNECTIONS.inc();

        info!(
            connection_id = %conn.id(),
            total = self.connections.len(),
            "Connection registered"
        );

        (conn, rx)
    }

    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Forget the connection and every subscription it held. Idempotent.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let Some((_, conn)) = self.connections.remove(&id) else {
            return false;
        };

        let keys = self.registry.remove_connection(id);
        metrics::ACTIVE_CONNECTIONS.dec();

        info!(
            connection_id = %id,
            subscriptions = keys.len(),
            duration_secs = conn.connected_at().elapsed().as_secs(),
            "Connection removed"
        );
        true
    }

    /// Disconnect and force the transport down
    pub fn terminate(&self, id: ConnectionId) -> bool {
        if let Some(conn) = self.get(id) {
            conn.terminate();
        }
        self.disconnect(id)
    }

    /// Subscribe a live connection to `key`.
    ///
    /// Returns `false` when the connection is no longer registered.
    pub fn subscribe(&self, id: ConnectionId, key: &str) -> bool {
        // The map guard blocks a concurrent `disconnect` until the edge exists
        let Some(_conn) = self.connections.get(&id) else {
            return false;
        };
        if self.registry.subscribe(id, key) {
            debug!(connection_id = %id, key, "Subscribed");
        }
        true
    }

    pub fn unsubscribe(&self, id: ConnectionId, key: &str) -> bool {
        let removed = self.registry.unsubscribe(id, key);
        if removed {
            debug!(connection_id = %id, key, "Unsubscribed");
        }
        removed
    }

    #[must_use]
    pub fn subscribers(&self, key: &str) -> Vec<ConnectionId> {
        self.registry.subscribers(key)
    }

    #[must_use]
    pub fn subscriptions_of(&self, id: ConnectionId) -> Vec<String> {
        self.registry.keys_of(id)
    }

    #[must_use]
    pub fn is_subscribed(&self, id: ConnectionId, key: &str) -> bool {
        self.registry.has_edge(id, key)
    }

    /// Queue a frame for `conn`, pruning it if the transport is gone
    pub fn send(&self, conn: &Connection, item: Outbound) -> SendStatus {
        let status = conn.send(item);
        match status {
            SendStatus::Sent => {}
            SendStatus::Dropped => {
                metrics::FRAMES_OVERFLOWED.inc();
                warn!(connection_id = %conn.id(), "Outbound queue full, frame dropped");
            }
            SendStatus::Closed => {
                self.disconnect(conn.id());
            }
        }
        status
    }

    /// Snapshot of every registered connection
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Connections registered since startup
    #[must_use]
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Terminate every connection
    pub fn close_all(&self) {
        let ids: Vec<_> = self.connections.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.terminate(id);
        }
    }
}

/// RAII guard that disconnects a connection when the transport handler exits
pub struct ConnectionGuard {
    id: ConnectionId,
    manager: Arc<ConnectionManager>,
}

impl ConnectionGuard {
    #[must_use]
    pub const fn new(id: ConnectionId, manager: Arc<ConnectionManager>) -> Self {
        Self { id, manager }
    }

    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.disconnect(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(ConnectionLimits::default(), 8))
    }

    #[tokio::test]
    async fn test_register_and_disconnect() {
        let manager = manager();
        let (conn, _rx) = manager.register(true);

        assert_eq!(manager.connection_count(), 1);
        assert!(manager.get(conn.id()).is_some());

        assert!(manager.disconnect(conn.id()));
        assert!(!manager.disconnect(conn.id()));
        assert_eq!(manager.connection_count(), 0);
        assert_eq!(manager.total_connections(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_removes_edges() {
        let manager = manager();
        let (a, _rx_a) = manager.register(true);
        let (b, _rx_b) = manager.register(true);

        assert!(manager.subscribe(a.id(), "u1"));
        assert!(manager.subscribe(a.id(), "u2"));
        assert!(manager.subscribe(b.id(), "u1"));

        manager.disconnect(a.id());
        assert_eq!(manager.subscribers("u1"), vec![b.id()]);
        assert!(manager.subscribers("u2").is_empty());
        assert!(manager.subscriptions_of(a.id()).is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_after_disconnect_is_rejected() {
        let manager = manager();
        let (conn, _rx) = manager.register(true);
        manager.disconnect(conn.id());

        assert!(!manager.subscribe(conn.id(), "u1"));
        assert!(manager.subscribers("u1").is_empty());
    }

    #[tokio::test]
    async fn test_send_to_closed_transport_prunes() {
        let manager = manager();
        let (conn, rx) = manager.register(true);
        manager.subscribe(conn.id(), "u1");
        drop(rx);

        let status = manager.send(&conn, Outbound::Ping);
        assert_eq!(status, SendStatus::Closed);
        assert!(manager.get(conn.id()).is_none());
        assert!(manager.subscribers("u1").is_empty());
    }

    #[tokio::test]
    async fn test_guard_disconnects_on_drop() {
        let manager = manager();
        let (conn, _rx) = manager.register(true);
        manager.subscribe(conn.id(), "u1");

        {
            let _guard = ConnectionGuard::new(conn.id(), Arc::clone(&manager));
        }

        assert_eq!(manager.connection_count(), 0);
        assert!(manager.subscribers("u1").is_empty());
    }

    #[tokio::test]
    async fn test_terminate_cancels_transport() {
        let manager = manager();
        let (conn, _rx) = manager.register(true);
        let token = conn.cancel_token();

        assert!(manager.terminate(conn.id()));
        assert!(token.is_cancelled());
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_subscribe_and_disconnect_leave_no_dangling_edge() {
        let manager = manager();

        for _ in 0..50 {
            let (conn, _rx) = manager.register(true);
            let id = conn.id();

            let subscriber = {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    for i in 0..20 {
                        manager.subscribe(id, &format!("k{i}"));
                    }
                })
            };
            let disconnector = {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    manager.disconnect(id);
                })
            };

            subscriber.await.unwrap();
            disconnector.await.unwrap();
            assert!(manager.subscriptions_of(id).is_empty());
        }
    }
}
