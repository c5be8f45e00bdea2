use super::{MessageBus, Payload, Subscription};
use crate::config::RedisSettings;
use crate::error::BrokerError;
use crate::utils::redis_url;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use redis::{aio::ConnectionManager, AsyncCommands};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Redis pub/sub transport.
///
/// Publishing shares one `ConnectionManager`; every subscription opens its
/// own dedicated pub/sub connection.
#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    publisher: ConnectionManager,
    endpoint: String,
}

impl fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBus")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl RedisBus {
    pub async fn connect(settings: &RedisSettings) -> Result<Self, BrokerError> {
        let url = redis_url(settings)
            .map_err(|e| BrokerError::Transport(format!("invalid Redis address: {}", e)))?;
        let endpoint = format!("{}:{}/{}", settings.host, settings.port, settings.db);
        Self::connect_url(&url, &endpoint, settings.connect_timeout()).await
    }

    pub async fn connect_url(
        url: &str,
        endpoint: &str,
        connect_timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        let connecting = ConnectionManager::new(client.clone());
        let mut publisher = tokio::time::timeout(connect_timeout, connecting)
            .await
            .map_err(|_| {
                BrokerError::Transport(format!("connecting to Redis at {} timed out", endpoint))
            })??;

        let ping = redis::cmd("PING");
        ping.query_async::<_, String>(&mut publisher).await?;

        info!("Connected pub/sub transport to Redis at {}", endpoint);
        Ok(Self {
            client,
            publisher,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn publish(&self, channel: &str, payload: Payload) -> Result<(), BrokerError> {
        let mut conn = self.publisher.clone();
        let receivers = conn.publish::<_, _, i64>(channel, payload).await?;
        debug!("Published to {} ({} receivers)", channel, receivers);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        debug!("Subscribed to Redis channel {}", channel);
        let messages = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec());
        Ok(messages.boxed())
    }
}

/// In-process transport with the same fan-out semantics as Redis pub/sub:
/// every subscriber of a channel receives every message published after it
/// subscribed, and publishing to a channel nobody listens on is not an error.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    channels: Arc<DashMap<String, broadcast::Sender<Payload>>>,
    capacity: usize,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InMemoryBus {
    /// `capacity` is the number of messages a slow subscriber may lag behind
    /// before it starts losing the oldest ones.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Payload> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, channel: &str, payload: Payload) -> Result<(), BrokerError> {
        // An error only means there are no subscribers right now.
        let receivers = self.sender(channel).send(payload).unwrap_or(0);
        debug!("Published to {} ({} receivers)", channel, receivers);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, BrokerError> {
        let receiver = self.sender(channel).subscribe();
        let channel = channel.to_string();
        let messages = stream::unfold(receiver, move |mut receiver| {
            let channel = channel.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(payload) => return Some((payload, receiver)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Subscriber on {} lagged, {} messages lost", channel, skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(messages.boxed())
    }
}
