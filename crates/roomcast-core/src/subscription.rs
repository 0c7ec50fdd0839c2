//! Per-room handle on an external pub/sub subscription.

use roomcast_protocol::RoomId;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Progress of the subscribe call behind a [`RoomSubscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    /// The backend has not confirmed the subscription yet.
    Pending,
    /// The listener is running.
    Active,
    /// The backend refused the subscription.
    Failed(String),
    /// Closed before the subscription became active.
    Closed,
}

/// The hub's record of one room's external subscription.
///
/// The listener itself is owned by the room's consumer task; this handle only
/// carries the token that stops that task and the outcome of the subscribe
/// call, which joiners arriving while it is in flight wait on. Closing it is
/// idempotent.
#[derive(Debug)]
pub struct RoomSubscription {
    room_id: RoomId,
    channel: String,
    token: CancellationToken,
    closed: AtomicBool,
    state: watch::Sender<SubscriptionState>,
}

impl RoomSubscription {
    /// Create a handle for `room_id` listening on `channel`.
    #[must_use]
    pub fn new(room_id: impl Into<RoomId>, channel: impl Into<String>, token: CancellationToken) -> Self {
        Self {
            room_id: room_id.into(),
            channel: channel.into(),
            token,
            closed: AtomicBool::new(false),
            state: watch::channel(SubscriptionState::Pending).0,
        }
    }

    /// Room this subscription feeds.
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// External channel name.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Record that the backend confirmed the subscription.
    ///
    /// Returns `false` if the subscription already left the pending state.
    pub fn activate(&self) -> bool {
        self.settle(SubscriptionState::Active)
    }

    /// Record that the backend refused the subscription.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.settle(SubscriptionState::Failed(reason.into()))
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        self.state.borrow().clone()
    }

    /// Wait until the subscription is no longer pending.
    pub async fn settled(&self) -> SubscriptionState {
        let mut state = self.state.subscribe();
        tokio::select! {
            biased;

            settled = state.wait_for(|s| *s != SubscriptionState::Pending) => match settled {
                Ok(settled) => settled.clone(),
                Err(_) => SubscriptionState::Closed,
            },
            _ = self.token.cancelled() => match self.state() {
                SubscriptionState::Pending => SubscriptionState::Closed,
                settled => settled,
            },
        }
    }

    /// Stop the consumer task.
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.settle(SubscriptionState::Closed);
        self.token.cancel();
        true
    }

    fn settle(&self, outcome: SubscriptionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state != SubscriptionState::Pending {
                return false;
            }
            *state = outcome;
            true
        })
    }

    /// Check if the subscription was closed, directly or by hub shutdown.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.token.is_cancelled()
    }

    /// Resolves once the subscription is closed.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}
