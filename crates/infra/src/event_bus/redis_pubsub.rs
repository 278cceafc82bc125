//! Redis pub/sub transport for invalidation events.
//!
//! Pub/sub is not durable: an instance that is disconnected while an event is
//! published misses it and relies on entry TTLs. The subscriber reconnects
//! with a fixed delay and listens on every invalidation channel.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, instrument, warn};

use warden_events::{ALL_CHANNELS, EventBus, InvalidationEvent, Subscription};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct RedisPubSubEventBus {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisPubSubEventBus {
    pub async fn connect(redis_url: &str) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl EventBus<InvalidationEvent> for RedisPubSubEventBus {
    type Error = RedisBusError;

    #[instrument(skip(self, message), fields(event_id = %message.event_id), err)]
    async fn publish(&self, channel: &str, message: &InvalidationEvent) -> Result<(), Self::Error> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(channel, payload).await?;
        debug!(channel, receivers, "published");
        Ok(())
    }

    fn subscribe(&self) -> Subscription<InvalidationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();

        tokio::spawn(async move {
            loop {
                match forward(&client, &tx).await {
                    Ok(()) => return,
                    Err(e) => {
                        warn!(error = %e, "invalidation subscription lost, reconnecting");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
                if tx.is_closed() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}

/// Forwards messages until the receiver is dropped (`Ok`) or the connection
/// fails (`Err`).
async fn forward(
    client: &redis::Client,
    tx: &mpsc::UnboundedSender<InvalidationEvent>,
) -> Result<(), redis::RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    for channel in ALL_CHANNELS {
        pubsub.subscribe(channel).await?;
    }

    let messages = pubsub.on_message();
    tokio::pin!(messages);
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "dropping non-text invalidation payload");
                continue;
            }
        };
        match serde_json::from_str::<InvalidationEvent>(&payload) {
            Ok(event) => {
                if tx.send(event).is_err() {
                    return Ok(());
                }
            }
            Err(e) => warn!(channel = msg.get_channel_name(), error = %e, "dropping malformed invalidation event"),
        }
    }

    Err(redis::RedisError::from((redis::ErrorKind::IoError, "pub/sub stream ended")))
}
