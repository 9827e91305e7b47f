use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use crate::connection::Outbound;
use crate::connection_manager::ConnectionManager;
use crate::metrics;

/// Reaps connections that stopped answering liveness probes.
///
/// Each sweep terminates every connection silent for more than two heartbeat
/// intervals and probes the rest.
pub struct LivenessMonitor {
    connections: Arc<ConnectionManager>,
    interval: Duration,
}

impl LivenessMonitor {
    #[must_use]
    pub const fn new(connections: Arc<ConnectionManager>, interval: Duration) -> Self {
        Self {
            connections,
            interval,
        }
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Run one sweep, returning how many connections were terminated
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let deadline = self.interval * 2;
        let mut reaped = 0;

        for conn in self.connections.all() {
            let silent_for = now.saturating_duration_since(conn.last_liveness());
            if silent_for > deadline {
                info!(
                    connection_id = %conn.id(),
                    silent_ms = silent_for.as_millis() as u64,
                    "Terminating unresponsive connection"
                );
                self.connections.terminate(conn.id());
                metrics::CONNECTIONS_REAPED.inc();
                reaped += 1;
            } else {
                self.connections.send(&conn, Outbound::Ping);
            }
        }

        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionLimits;

    fn setup() -> (Arc<ConnectionManager>, LivenessMonitor) {
        let manager = Arc::new(ConnectionManager::new(ConnectionLimits::default(), 8));
        let monitor = LivenessMonitor::new(manager.clone(), Duration::from_secs(15));
        (manager, monitor)
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_connection_is_probed() {
        let (manager, monitor) = setup();
        let (_conn, mut rx) = manager.register(true);

        assert_eq!(monitor.sweep(), 0);
        assert_eq!(rx.try_recv().unwrap(), Outbound::Ping);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_is_reaped() {
        let (manager, monitor) = setup();
        let (conn, _rx) = manager.register(true);
        manager.subscribe(conn.id(), "u1");
        let token = conn.cancel_token();

        tokio::time::advance(Duration::from_secs(31)).await;

        assert_eq!(monitor.sweep(), 1);
        assert!(token.is_cancelled());
        assert_eq!(manager.connection_count(), 0);
        assert!(manager.subscribers("u1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keeps_connection_alive() {
        let (manager, monitor) = setup();
        let (conn, _rx) = manager.register(true);

        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(15)).await;
            conn.record_liveness();
            assert_eq!(monitor.sweep(), 0);
        }

        // Exactly two intervals is still within the deadline
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(monitor.sweep(), 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(monitor.sweep(), 1);
    }
}
