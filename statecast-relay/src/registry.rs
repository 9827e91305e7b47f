//! Subscription registry
//!
//! Tracks which connections follow which keys. Both directions are kept so
//! fan-out (key -> connections) and disconnect cleanup (connection -> keys)
//! stay proportional to the data actually touched. The two maps live behind
//! one lock and always change together.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

use crate::connection::ConnectionId;

#[derive(Debug, Default)]
struct Edges {
    by_key: HashMap<String, HashSet<ConnectionId>>,
    by_conn: HashMap<ConnectionId, HashSet<String>>,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    edges: Mutex<Edges>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the edge. Returns `false` if it already existed.
    pub fn subscribe(&self, conn: ConnectionId, key: &str) -> bool {
        let mut edges = self.edges.lock();
        let inserted = edges
            .by_key
            .entry(key.to_string())
            .or_default()
            .insert(conn);
        edges.by_conn.entry(conn).or_default().insert(key.to_string());
        inserted
    }

    /// Remove the edge. Returns `false` if there was nothing to remove.
    pub fn unsubscribe(&self, conn: ConnectionId, key: &str) -> bool {
        let mut edges = self.edges.lock();

        let removed = match edges.by_key.get_mut(key) {
            Some(conns) => {
                let removed = conns.remove(&conn);
                if conns.is_empty() {
                    edges.by_key.remove(key);
                }
                removed
            }
            None => false,
        };

        if let Some(keys) = edges.by_conn.get_mut(&conn) {
            keys.remove(key);
            if keys.is_empty() {
                edges.by_conn.remove(&conn);
            }
        }

        removed
    }

    /// Drop every edge of `conn`, returning the keys it followed
    pub fn remove_connection(&self, conn: ConnectionId) -> Vec<String> {
        let mut edges = self.edges.lock();
        let Some(keys) = edges.by_conn.remove(&conn) else {
            return Vec::new();
        };

        for key in &keys {
            if let Some(conns) = edges.by_key.get_mut(key) {
                conns.remove(&conn);
                if conns.is_empty() {
                    edges.by_key.remove(key);
                }
            }
        }

        keys.into_iter().collect()
    }

    /// Connections currently following `key`
    #[must_use]
    pub fn subscribers(&self, key: &str) -> Vec<ConnectionId> {
        self.edges
            .lock()
            .by_key
            .get(key)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn keys_of(&self, conn: ConnectionId) -> Vec<String> {
        self.edges
            .lock()
            .by_conn
            .get(&conn)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has_edge(&self, conn: ConnectionId, key: &str) -> bool {
        self.edges
            .lock()
            .by_key
            .get(key)
            .is_some_and(|conns| conns.contains(&conn))
    }

    /// Number of keys with at least one subscriber
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.edges.lock().by_key.len()
    }

    /// Number of connections with at least one subscription
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.edges.lock().by_conn.len()
    }
}
