use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client as RedisClient};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use super::bus::EventBus;
use super::events::BusEnvelope;
use crate::error::{Error, Result};

/// Timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Redis Pub/Sub bus
///
/// All instances publish to and subscribe on one channel. The publishing
/// connection is cached and dropped on the first failure, so the next publish
/// reconnects.
pub struct RedisBus {
    redis_client: RedisClient,
    channel: String,
    publish_conn: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBus {
    pub fn new(redis_url: &str, channel: impl Into<String>) -> Result<Self> {
        let redis_client = RedisClient::open(redis_url)?;
        Ok(Self {
            redis_client,
            channel: channel.into(),
            publish_conn: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn publish_connection(&self) -> Result<MultiplexedConnection> {
        let mut slot = self.publish_conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }

        let conn = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.redis_client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| Error::Timeout("getting Redis connection for publishing".to_string()))??;

        info!(channel = %self.channel, "Redis publisher (re)connected");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_publish_connection(&self) {
        self.publish_conn.lock().await.take();
    }
}

#[async_trait]
impl EventBus for RedisBus {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, envelope: &BusEnvelope) -> Result<()> {
        let payload = serde_json::to_string(envelope)?;
        let mut conn = self.publish_connection().await?;

        let result = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            conn.publish::<_, _, usize>(&self.channel, &payload),
        )
        .await;

        match result {
            Ok(Ok(receivers)) => {
                debug!(key = %envelope.event.key, receivers, "Event published to Redis");
                Ok(())
            }
            Ok(Err(e)) => {
                self.reset_publish_connection().await;
                Err(e.into())
            }
            Err(_) => {
                self.reset_publish_connection().await;
                Err(Error::Timeout("publishing to Redis".to_string()))
            }
        }
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, BusEnvelope>> {
        let mut pubsub = timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            self.redis_client.get_async_pubsub(),
        )
        .await
        .map_err(|_| Error::Timeout("getting Redis Pub/Sub connection".to_string()))??;

        timeout(
            Duration::from_secs(REDIS_TIMEOUT_SECS),
            pubsub.subscribe(&self.channel),
        )
        .await
        .map_err(|_| Error::Timeout(format!("subscribing to {}", self.channel)))??;

        info!(channel = %self.channel, "Redis subscriber connected");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "Invalid payload");
                    return None;
                }
            };

            match serde_json::from_str::<BusEnvelope>(&payload) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!(error = %e, payload = %payload, "Failed to deserialize bus envelope");
                    None
                }
            }
        });

        Ok(stream.boxed())
    }
}
