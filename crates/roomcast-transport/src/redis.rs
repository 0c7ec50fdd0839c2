//! Redis pub/sub backend.
//!
//! Publishing goes through one shared [`ConnectionManager`], which reconnects
//! on its own. Every subscription opens a dedicated pub/sub connection, since
//! a Redis connection in subscribe mode cannot issue other commands.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Msg};
use tracing::{debug, info, trace};

use crate::pubsub::{PubSub, PubSubError, Subscription};

/// Redis pub/sub backend.
#[derive(Clone)]
pub struct RedisPubSub {
    client: Client,
    publisher: ConnectionManager,
}

impl RedisPubSub {
    /// Connect to the Redis server at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, PubSubError> {
        let client = Client::open(url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;

        info!("Connected to Redis pub/sub");
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), PubSubError> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn.publish(channel, &payload[..]).await?;
        trace!(channel = %channel, receivers, "Published message");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, PubSubError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        // Resolves on the server's subscribe confirmation.
        pubsub.subscribe(channel).await?;
        debug!(channel = %channel, "Redis subscription confirmed");

        Ok(Box::new(RedisSubscription {
            channel: channel.to_string(),
            messages: Some(pubsub.into_on_message().boxed()),
        }))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// A subscription backed by a dedicated Redis pub/sub connection.
pub struct RedisSubscription {
    channel: String,
    messages: Option<BoxStream<'static, Msg>>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn recv(&mut self) -> Option<Bytes> {
        let messages = self.messages.as_mut()?;
        messages
            .next()
            .await
            .map(|msg| Bytes::copy_from_slice(msg.get_payload_bytes()))
    }

    async fn close(&mut self) -> Result<(), PubSubError> {
        // Dropping the connection ends the subscription server-side.
        if self.messages.take().is_some() {
            debug!(channel = %self.channel, "Redis subscription released");
        }
        Ok(())
    }
}
