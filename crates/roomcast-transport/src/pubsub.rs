//! External publish/subscribe channel abstraction.
//!
//! The hub uses a [`PubSub`] backend as its only cross-process transport:
//! chat messages are published to a channel and every process with local
//! members of that room holds a [`Subscription`] to it.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Pub/sub errors.
#[derive(Debug, Error)]
pub enum PubSubError {
    /// The backend cannot be reached.
    #[error("Pub/sub backend unavailable: {0}")]
    Unavailable(String),

    /// The subscription or backend was already closed.
    #[error("Pub/sub channel closed")]
    Closed,

    /// Redis error.
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// A publish/subscribe backend.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish `payload` on `channel`.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), PubSubError>;

    /// Subscribe to `channel`.
    ///
    /// Resolves only once the backend confirmed the subscription, so a
    /// message published after this returns is delivered to it.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, PubSubError>;

    /// Get the backend name (e.g., "redis", "memory").
    fn name(&self) -> &'static str;
}

/// An active subscription to one channel.
#[async_trait]
pub trait Subscription: Send {
    /// The subscribed channel.
    fn channel(&self) -> &str;

    /// Receive the next payload.
    ///
    /// Returns `None` once the channel was closed by either side.
    async fn recv(&mut self) -> Option<Bytes>;

    /// Release the underlying listener. Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), PubSubError>;
}
