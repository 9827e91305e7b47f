use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tracing::warn;

use super::events::BusEnvelope;
use crate::error::Result;

/// Shared topic connecting relay instances
///
/// Implementations deliver every published envelope to every live
/// subscription, including the publisher's own. Filtering by node id is the
/// caller's job.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    async fn publish(&self, envelope: &BusEnvelope) -> Result<()>;

    /// Open a subscription. The stream ends when the underlying connection is
    /// lost.
    async fn subscribe(&self) -> Result<BoxStream<'static, BusEnvelope>>;
}

/// In-process bus for single-process deployments and tests
///
/// Envelopes go through the same JSON encoding as the Redis bus.
#[derive(Clone)]
pub struct MemoryBus {
    tx: broadcast::Sender<String>,
}

impl MemoryBus {
    pub const DEFAULT_CAPACITY: usize = 1024;

    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn publish(&self, envelope: &BusEnvelope) -> Result<()> {
        let payload = serde_json::to_string(envelope)?;
        // Nobody listening is not a failure
        let _ = self.tx.send(payload);
        Ok(())
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, BusEnvelope>> {
        let rx = self.tx.subscribe();
        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => match serde_json::from_str::<BusEnvelope>(&payload) {
                        Ok(envelope) => return Some((envelope, rx)),
                        Err(e) => warn!(error = %e, "Failed to deserialize bus envelope"),
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Memory bus subscriber lagged, events lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}
