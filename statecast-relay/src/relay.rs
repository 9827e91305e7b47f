//! Relay facade
//!
//! One `Relay` per process. It wires the State Cache, the connection manager,
//! the batch queues, the liveness monitor and the optional bus bridge, and is
//! the only thing the transport adapter talks to.
//!
//! Event flow:
//! 1. a local `StateCache::set` announces the new record
//! 2. the record becomes an event, published to the bus and enqueued locally
//! 3. peers merge the carried record into their cache and enqueue the event
//! 4. each key's batch is flushed to that key's current subscribers

use parking_lot::Mutex;
use rand::RngExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use statecast_core::cache::StateCache;
use statecast_core::config::RelayConfig;
use statecast_core::models::{Event, StateRecord};

use crate::batch::{BatchConfig, BatchQueue};
use crate::connection::{Connection, ConnectionId, ConnectionLimits, Outbound};
use crate::connection_manager::{ConnectionGuard, ConnectionManager};
use crate::delivery::Deliverer;
use crate::frames::{ClientFrame, OpFrame, ServerFrame};
use crate::hooks::Hooks;
use crate::liveness::LivenessMonitor;
use crate::metrics;
use crate::sync::{BusBridge, EventBus};

/// What the transport should do after a client frame was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Continue,
    /// Close the transport once queued frames are flushed
    Close,
}

/// Everything a transport adapter needs to drive one connection
pub struct ConnectionSession {
    pub id: ConnectionId,
    /// Disconnects the connection when dropped
    pub guard: ConnectionGuard,
    /// Frames to write to the client, in order
    pub outbound: mpsc::Receiver<Outbound>,
    /// Cancelled when the relay terminates the connection
    pub cancel: CancellationToken,
}

pub struct Relay {
    node_id: String,
    config: RelayConfig,
    cache: StateCache,
    hooks: Hooks,
    connections: Arc<ConnectionManager>,
    batches: Arc<BatchQueue>,
    liveness: LivenessMonitor,
    bridge: Mutex<Option<Arc<BusBridge>>>,
    cancel_token: CancellationToken,
}

impl Relay {
    #[must_use]
    pub fn new(
        node_id: impl Into<String>,
        config: &RelayConfig,
        cache: StateCache,
        hooks: Hooks,
    ) -> Arc<Self> {
        let limits = ConnectionLimits {
            rate: config.rate,
            burst: config.burst,
            inbound_frames_per_second: config.inbound_frames_per_second,
        };
        let connections = Arc::new(ConnectionManager::new(limits, config.outbound_buffer));
        let deliverer = Arc::new(Deliverer::new(Arc::clone(&connections), hooks.clone()));
        let batches = BatchQueue::new(BatchConfig::from(config), deliverer);
        let liveness = LivenessMonitor::new(Arc::clone(&connections), config.heartbeat_interval());

        Arc::new(Self {
            node_id: node_id.into(),
            config: config.clone(),
            cache,
            hooks,
            connections,
            batches,
            liveness,
            bridge: Mutex::new(None),
            cancel_token: CancellationToken::new(),
        })
    }

    /// Start background work: cache listener, bus bridge, liveness sweeps.
    ///
    /// Without a bus the relay runs in single-node mode.
    pub async fn start(self: &Arc<Self>, bus: Option<Arc<dyn EventBus>>) {
        let publish_tx = match bus {
            Some(bus) => {
                let bus_name = bus.name();
                let bridge = Arc::new(BusBridge::new(bus, self.node_id.clone()));
                let (publish_tx, inbound_rx) = Arc::clone(&bridge).start().await;
                *self.bridge.lock() = Some(bridge);

                tokio::spawn(Arc::clone(self).run_inbound(inbound_rx));
                info!(node_id = %self.node_id, bus = bus_name, "Relay connected to event bus");
                Some(publish_tx)
            }
            None => {
                info!(node_id = %self.node_id, "Relay running in single-node mode");
                None
            }
        };

        let updates = self.cache.subscribe_updates();
        tokio::spawn(Arc::clone(self).run_local_updates(updates, publish_tx));
        tokio::spawn(Arc::clone(self).run_maintenance());
    }

    async fn run_local_updates(
        self: Arc<Self>,
        mut updates: broadcast::Receiver<StateRecord>,
        publish_tx: Option<mpsc::Sender<Event>>,
    ) {
        loop {
            let record = tokio::select! {
                () = self.cancel_token.cancelled() => return,
                record = updates.recv() => record,
            };

            let record = match record {
                Ok(record) => record,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Cache update listener lagged, events lost");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };

            let event = Event::from_record(&record);
            if let Some(tx) = &publish_tx {
                if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                    warn!(key = %event.key, "Bus publish channel full, event not published");
                }
            }
            self.ingest(event).await;
        }
    }

    async fn run_inbound(self: Arc<Self>, mut inbound_rx: mpsc::Receiver<Event>) {
        loop {
            let event = tokio::select! {
                () = self.cancel_token.cancelled() => return,
                event = inbound_rx.recv() => event,
            };
            let Some(event) = event else {
                return;
            };

            if let Some(record) = event.record() {
                self.cache.merge(record);
            }
            self.ingest(event).await;
        }
    }

    async fn run_maintenance(self: Arc<Self>) {
        let period = self.liveness.interval();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let reaped = self.liveness.sweep();
            let compacted = self.batches.compact();
            debug!(
                reaped,
                compacted,
                connections = self.connections.connection_count(),
                "Maintenance sweep"
            );
        }
    }

    /// Score an event and hand it to its key's batch queue
    pub async fn ingest(&self, event: Event) {
        let event = match &self.hooks.scorer {
            None => event,
            Some(scorer) => match scorer.score(&event).await {
                Ok(score) => {
                    if let Some(probability) = score.drop_probability {
                        if rand::rng().random::<f64>() < probability {
                            metrics::EVENTS_DROPPED.inc();
                            debug!(key = %event.key, probability, "Event dropped by scorer");
                            return;
                        }
                    }
                    match score.priority {
                        Some(priority) => event.with_priority(priority),
                        None => event,
                    }
                }
                Err(e) => {
                    debug!(key = %event.key, error = %e, "Scorer failed, keeping event");
                    event
                }
            },
        };

        self.batches.enqueue(event);
    }

    /// Register a new client connection and greet it
    pub fn connect(&self) -> ConnectionSession {
        let (conn, outbound) = self.connections.register(!self.config.require_auth);
        self.send_frame(&conn, OpFrame::connection_ack(conn.id()));

        ConnectionSession {
            id: conn.id(),
            guard: ConnectionGuard::new(conn.id(), Arc::clone(&self.connections)),
            outbound,
            cancel: conn.cancel_token(),
        }
    }

    /// Handle one text frame from a client
    pub async fn handle_message(&self, id: ConnectionId, raw: &str) -> FrameOutcome {
        let Some(conn) = self.connections.get(id) else {
            return FrameOutcome::Close;
        };

        if !conn.allow_inbound() {
            debug!(connection_id = %id, "Inbound frame rate exceeded, frame ignored");
            return FrameOutcome::Continue;
        }

        let Some(frame) = ClientFrame::parse(raw) else {
            return FrameOutcome::Continue;
        };

        if self.config.require_auth && !conn.is_authenticated() {
            return self.handle_unauthenticated(&conn, frame).await;
        }

        match frame {
            ClientFrame::Auth { token } => {
                let valid = match token {
                    Some(token) => self.hooks.verify_token(&token).await,
                    None => false,
                };
                if valid {
                    conn.set_authenticated();
                    self.send_frame(&conn, OpFrame::AuthSuccess);
                } else {
                    self.send_frame(&conn, OpFrame::AuthFail);
                }
            }
            ClientFrame::Subscribe { key } => self.subscribe(&conn, &key).await,
            ClientFrame::Unsubscribe { key } => {
                self.connections.unsubscribe(id, &key);
            }
            ClientFrame::Ping => self.send_frame(&conn, OpFrame::pong()),
            ClientFrame::Unknown => {}
        }

        FrameOutcome::Continue
    }

    async fn handle_unauthenticated(&self, conn: &Connection, frame: ClientFrame) -> FrameOutcome {
        if let ClientFrame::Auth { token: Some(token) } = &frame {
            if self.hooks.verify_token(token).await {
                conn.set_authenticated();
                self.send_frame(conn, OpFrame::AuthSuccess);
                info!(connection_id = %conn.id(), "Connection authenticated");
                return FrameOutcome::Continue;
            }
        }

        info!(connection_id = %conn.id(), "Authentication failed, closing connection");
        self.send_frame(conn, OpFrame::AuthFail);
        self.connections.send(conn, Outbound::Close);
        FrameOutcome::Close
    }

    async fn subscribe(&self, conn: &Connection, key: &str) {
        if !self.hooks.is_authorized(&conn.context(), key).await {
            debug!(connection_id = %conn.id(), key, "Subscription denied");
            self.send_frame(
                conn,
                OpFrame::SubscribeDenied {
                    key: key.to_string(),
                },
            );
            return;
        }

        if !self.connections.subscribe(conn.id(), key) {
            return;
        }

        if let Some(record) = self.cache.get(key) {
            self.send_frame(conn, ServerFrame::snapshot(record));
        }
    }

    fn send_frame(&self, conn: &Connection, frame: impl Into<ServerFrame>) {
        match frame.into().encode() {
            Ok(text) => {
                self.connections.send(conn, Outbound::Text(text.into()));
            }
            Err(e) => warn!(connection_id = %conn.id(), error = %e, "Failed to encode frame"),
        }
    }

    /// A liveness probe was answered
    pub fn record_liveness(&self, id: ConnectionId) {
        if let Some(conn) = self.connections.get(id) {
            conn.record_liveness();
        }
    }

    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.connections.disconnect(id)
    }

    /// Stop background work and close every connection
    pub fn shutdown(&self) {
        info!(node_id = %self.node_id, "Shutting down relay");
        self.cancel_token.cancel();
        if let Some(bridge) = self.bridge.lock().take() {
            bridge.shutdown();
        }
        self.batches.shutdown();
        self.connections.close_all();
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub const fn cache(&self) -> &StateCache {
        &self.cache
    }

    #[must_use]
    pub const fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.connection_count()
    }

    /// Current batch window of `key`, if the key has a batch queue
    #[must_use]
    pub fn batch_window(&self, key: &str) -> Option<Duration> {
        self.batches.window(key)
    }

    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }
}
