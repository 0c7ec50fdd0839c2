//! In-memory pub/sub backend.
//!
//! Each channel is a `tokio::sync::broadcast` sender shared by every
//! subscription to it. Only fans out within one process: suited to
//! single-node deployments and tests.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::pubsub::{PubSub, PubSubError, Subscription};

/// Default per-channel broadcast capacity.
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

type Channels = Arc<DashMap<String, broadcast::Sender<Bytes>>>;

/// In-memory pub/sub backend.
#[derive(Clone)]
pub struct MemoryPubSub {
    channels: Channels,
    capacity: usize,
}

impl MemoryPubSub {
    /// Create a backend with the default per-channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a backend with a specific per-channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Number of live subscriptions to `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Number of channels with at least one subscription.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Close `channel` from the backend side, ending every subscription to it.
    ///
    /// Returns `true` if the channel existed.
    pub fn close_channel(&self, channel: &str) -> bool {
        let removed = self.channels.remove(channel).is_some();
        if removed {
            debug!(channel = %channel, "Closed channel");
        }
        removed
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), PubSubError> {
        let receivers = self
            .channels
            .get(channel)
            .map(|sender| sender.send(payload).unwrap_or_default())
            .unwrap_or(0);
        trace!(channel = %channel, receivers, "Published message");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, PubSubError> {
        let receiver = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| {
                debug!(channel = %channel, "Creating new channel");
                broadcast::channel(self.capacity).0
            })
            .subscribe();

        Ok(Box::new(MemorySubscription {
            channel: channel.to_string(),
            receiver: Some(receiver),
            channels: Arc::clone(&self.channels),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// A subscription to an in-memory channel.
pub struct MemorySubscription {
    channel: String,
    receiver: Option<broadcast::Receiver<Bytes>>,
    channels: Channels,
}

impl MemorySubscription {
    fn release(&mut self) {
        if self.receiver.take().is_some() {
            // Drop the channel once its last subscription is gone.
            self.channels
                .remove_if(&self.channel, |_, sender| sender.receiver_count() == 0);
        }
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn recv(&mut self) -> Option<Bytes> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(payload) => return Some(payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "Subscription lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn close(&mut self) -> Result<(), PubSubError> {
        self.release();
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.release();
    }
}
