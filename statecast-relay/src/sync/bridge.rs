use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use statecast_core::models::Event;

use super::bus::EventBus;
use super::events::BusEnvelope;
use crate::metrics;

/// Initial backoff delay for bus reconnection
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay for bus reconnection
const MAX_BACKOFF_SECS: u64 = 30;

/// Connects a relay instance to the shared event bus.
///
/// Locally originated events go out through a bounded publish channel drained
/// by one publisher task. Envelopes from peer nodes come back tagged as remote
/// on the inbound channel; envelopes carrying this node's id are discarded so
/// an event is never re-published or delivered twice.
pub struct BusBridge {
    bus: Arc<dyn EventBus>,
    node_id: String,
    cancel_token: CancellationToken,
}

impl BusBridge {
    /// Capacity for the publish channel. Events are dropped with a warning when
    /// full (e.g. during a prolonged bus outage).
    pub const PUBLISH_CHANNEL_CAPACITY: usize = 10_000;

    /// Capacity for the channel of events received from peers
    pub const INBOUND_CHANNEL_CAPACITY: usize = 10_000;

    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, node_id: impl Into<String>) -> Self {
        Self {
            bus,
            node_id: node_id.into(),
            cancel_token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get the cancellation token for external shutdown signaling
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Stop the publisher and subscriber tasks
    pub fn shutdown(&self) {
        info!(bus = self.bus.name(), "Shutting down bus bridge");
        self.cancel_token.cancel();
    }

    /// Start the bridge.
    ///
    /// The first subscription attempt completes before this returns, so events
    /// published by peers afterwards are not missed. Returns the publish
    /// sender and the receiver of remote events.
    pub async fn start(self: Arc<Self>) -> (mpsc::Sender<Event>, mpsc::Receiver<Event>) {
        let (publish_tx, publish_rx) = mpsc::channel::<Event>(Self::PUBLISH_CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Event>(Self::INBOUND_CHANNEL_CAPACITY);

        tokio::spawn(Arc::clone(&self).run_publisher(publish_rx));

        let initial = match self.bus.subscribe().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                error!(bus = self.bus.name(), error = %e, "Initial bus subscription failed, retrying in background");
                None
            }
        };
        tokio::spawn(self.run_subscriber_loop(initial, inbound_tx));

        (publish_tx, inbound_rx)
    }

    async fn run_publisher(self: Arc<Self>, mut publish_rx: mpsc::Receiver<Event>) {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;

        loop {
            let event = tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!("Bus publisher task cancelled");
                    return;
                }
                event = publish_rx.recv() => event,
            };
            let Some(event) = event else {
                // Channel closed, publisher shutting down
                debug!("Bus publisher channel closed, exiting");
                return;
            };

            let envelope = BusEnvelope::new(self.node_id.clone(), event);
            match self.bus.publish(&envelope).await {
                Ok(()) => {
                    metrics::BUS_PUBLISHED.inc();
                    backoff_secs = INITIAL_BACKOFF_SECS;
                    continue;
                }
                Err(e) => {
                    metrics::BUS_PUBLISH_FAILURES.inc();
                    error!(
                        error = %e,
                        key = %envelope.event.key,
                        backoff_secs,
                        "Failed to publish event, retrying after backoff"
                    );
                }
            }

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!("Bus publisher task cancelled during backoff");
                    return;
                }
                () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
            }
            backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);

            // One retry, then the event is dropped
            match self.bus.publish(&envelope).await {
                Ok(()) => {
                    metrics::BUS_PUBLISHED.inc();
                    debug!(key = %envelope.event.key, "Retried event published");
                    backoff_secs = INITIAL_BACKOFF_SECS;
                }
                Err(e) => {
                    metrics::BUS_PUBLISH_FAILURES.inc();
                    warn!(
                        error = %e,
                        key = %envelope.event.key,
                        "Retry publish failed, dropping event"
                    );
                }
            }
        }
    }

    async fn run_subscriber_loop(
        self: Arc<Self>,
        mut initial: Option<BoxStream<'static, BusEnvelope>>,
        inbound_tx: mpsc::Sender<Event>,
    ) {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;

        loop {
            // Check cancellation before each reconnect attempt
            if self.cancel_token.is_cancelled() {
                info!("Bus subscriber task cancelled");
                return;
            }

            match self.run_subscriber(initial.take(), &inbound_tx).await {
                SubscriberExit::Cancelled => {
                    info!("Bus subscriber task cancelled");
                    return;
                }
                SubscriberExit::Disconnected => {
                    // The bus was reachable, so start over from the shortest delay
                    error!(
                        bus = self.bus.name(),
                        "Bus subscription ended (connection lost), reconnecting after {}s",
                        INITIAL_BACKOFF_SECS
                    );
                    backoff_secs = INITIAL_BACKOFF_SECS;
                }
                SubscriberExit::ConnectFailed(e) => {
                    error!(
                        bus = self.bus.name(),
                        error = %e,
                        backoff_secs,
                        "Bus subscriber failed to connect, retrying after backoff"
                    );
                }
            }

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!("Bus subscriber task cancelled during backoff");
                    return;
                }
                () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
            }

            backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
        }
    }

    /// Forward peer events until the subscription ends.
    ///
    /// Uses `stream` when given, otherwise opens a new subscription.
    async fn run_subscriber(
        &self,
        stream: Option<BoxStream<'static, BusEnvelope>>,
        inbound_tx: &mpsc::Sender<Event>,
    ) -> SubscriberExit {
        let mut stream = match stream {
            Some(stream) => stream,
            None => match self.bus.subscribe().await {
                Ok(stream) => stream,
                Err(e) => return SubscriberExit::ConnectFailed(anyhow::anyhow!(e)),
            },
        };

        loop {
            let envelope = tokio::select! {
                () = self.cancel_token.cancelled() => return SubscriberExit::Cancelled,
                envelope = stream.next() => envelope,
            };
            let Some(envelope) = envelope else {
                return SubscriberExit::Disconnected;
            };

            // Ignore events from this node (already handled locally)
            if envelope.is_from(&self.node_id) {
                continue;
            }

            metrics::BUS_RECEIVED.inc();
            debug!(
                from = %envelope.node_id,
                key = %envelope.event.key,
                "Received event from peer"
            );

            if inbound_tx.send(envelope.event.into_remote()).await.is_err() {
                // Receiver dropped, the relay is gone
                return SubscriberExit::Cancelled;
            }
        }
    }
}

/// Describes how the subscriber loop exited, enabling proper backoff behavior.
enum SubscriberExit {
    /// Subscribed and processing, but the stream ended. Backoff resets since
    /// the bus was healthy before it dropped.
    Disconnected,
    /// Failed to subscribe. Backoff keeps increasing.
    ConnectFailed(anyhow::Error),
    /// Shutdown requested
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::sync::bus::MemoryBus;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(key: &str) -> Event {
        Event::new(key, "state", json!({ "key": key }))
    }

    #[tokio::test]
    async fn test_peer_events_arrive_tagged_remote() {
        let bus: Arc<dyn EventBus> = Arc::new(MemoryBus::new());
        let a = Arc::new(BusBridge::new(bus.clone(), "node-a"));
        let b = Arc::new(BusBridge::new(bus.clone(), "node-b"));

        let (publish_a, mut inbound_a) = a.clone().start().await;
        let (_publish_b, mut inbound_b) = b.clone().start().await;

        publish_a.send(event("u1")).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), inbound_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.key, "u1");
        assert!(received.remote);

        // The publisher never hears its own event back
        assert!(
            tokio::time::timeout(Duration::from_millis(100), inbound_a.recv())
                .await
                .is_err()
        );

        a.shutdown();
        b.shutdown();
    }

    /// Fails the first `failures` calls of each operation
    struct FlakyBus {
        inner: MemoryBus,
        publish_failures: AtomicUsize,
        subscribe_failures: AtomicUsize,
        publish_attempts: AtomicUsize,
    }

    impl FlakyBus {
        fn new(publish_failures: usize, subscribe_failures: usize) -> Self {
            Self {
                inner: MemoryBus::new(),
                publish_failures: AtomicUsize::new(publish_failures),
                subscribe_failures: AtomicUsize::new(subscribe_failures),
                publish_attempts: AtomicUsize::new(0),
            }
        }

        fn fail(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl EventBus for FlakyBus {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn publish(&self, envelope: &BusEnvelope) -> Result<()> {
            self.publish_attempts.fetch_add(1, Ordering::SeqCst);
            if Self::fail(&self.publish_failures) {
                return Err(Error::Timeout("publish refused".to_string()));
            }
            self.inner.publish(envelope).await
        }

        async fn subscribe(&self) -> Result<BoxStream<'static, BusEnvelope>> {
            if Self::fail(&self.subscribe_failures) {
                return Err(Error::Timeout("subscribe refused".to_string()));
            }
            self.inner.subscribe().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_publish_is_retried_once() {
        let flaky = Arc::new(FlakyBus::new(1, 0));
        let mut peer = flaky.inner.subscribe().await.unwrap();
        let bridge = Arc::new(BusBridge::new(flaky.clone(), "node-a"));
        let (publish_tx, _inbound) = bridge.clone().start().await;

        publish_tx.send(event("u1")).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), peer.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.event.key, "u1");
        assert_eq!(flaky.publish_attempts.load(Ordering::SeqCst), 2);
        bridge.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_dropped_after_failed_retry() {
        let flaky = Arc::new(FlakyBus::new(2, 0));
        let mut peer = flaky.inner.subscribe().await.unwrap();
        let bridge = Arc::new(BusBridge::new(flaky.clone(), "node-a"));
        let (publish_tx, _inbound) = bridge.clone().start().await;

        publish_tx.send(event("lost")).await.unwrap();
        publish_tx.send(event("kept")).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), peer.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.event.key, "kept");
        assert_eq!(flaky.publish_attempts.load(Ordering::SeqCst), 3);
        bridge.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriber_reconnects_after_failures() {
        let flaky = Arc::new(FlakyBus::new(0, 2));
        let bridge = Arc::new(BusBridge::new(flaky.clone(), "node-b"));
        let (_publish_tx, mut inbound) = bridge.clone().start().await;

        // Initial attempt and the immediate retry fail, the one after 1s succeeds
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(flaky.inner.subscriber_count(), 1);

        flaky
            .inner
            .publish(&BusEnvelope::new("node-a", event("u1")))
            .await
            .unwrap();
        let received = tokio::time::timeout(Duration::from_secs(1), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(received.remote);
        bridge.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_stops_subscriber() {
        let bus = Arc::new(MemoryBus::new());
        let bridge = Arc::new(BusBridge::new(bus.clone(), "node-a"));
        let (_publish_tx, mut inbound) = bridge.clone().start().await;

        bridge.shutdown();
        let closed = tokio::time::timeout(Duration::from_secs(1), inbound.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
    }
}
