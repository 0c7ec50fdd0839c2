//! The connection hub.
//!
//! One [`Hub`] per process tracks every registered connection, the rooms
//! they joined and one external subscription per non-empty room. Chat
//! messages are never delivered locally: they are published to the room's
//! channel and reach local members through that room's subscription, the
//! same way they reach every other process.

use async_trait::async_trait;
use bytes::Bytes;
use roomcast_protocol::{codec, validate_room_id, Action, Envelope, ProtocolError, RoomId};
use roomcast_transport::{ConnectionId, PubSub, PubSubError, Subscription};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::room::Room;
use crate::subscription::{RoomSubscription, SubscriptionState};
use crate::traits::{Client, Dispatcher};

/// Default prefix of a room's external channel name.
pub const DEFAULT_CHANNEL_PREFIX: &str = "room:";

/// Hub errors.
#[derive(Debug, Error)]
pub enum HubError {
    /// Invalid room ID.
    #[error("Invalid room ID: {0}")]
    InvalidRoomId(&'static str),

    /// The hub was shut down.
    #[error("Hub is closed")]
    Closed,

    /// The client already started closing.
    #[error("Connection closed: {0}")]
    ConnectionClosed(ConnectionId),

    /// Another principal's client holds the connection ID.
    #[error("Connection ID already in use: {0}")]
    ConnectionIdInUse(ConnectionId),

    /// Action the hub does not understand.
    #[error("Unsupported action: {0}")]
    UnsupportedAction(String),

    /// Envelope could not be serialized.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Subscribing to a room channel failed.
    #[error("Failed to subscribe to {channel}: {source}")]
    Subscribe {
        channel: String,
        #[source]
        source: PubSubError,
    },

    /// Publishing to a room channel failed.
    #[error("Failed to publish to {channel}: {source}")]
    Publish {
        channel: String,
        #[source]
        source: PubSubError,
    },
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Prefix prepended to a room ID to form its channel name.
    pub channel_prefix: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Registered connections.
    pub connection_count: usize,
    /// Rooms with at least one member.
    pub room_count: usize,
    /// Active or pending room subscriptions.
    pub subscription_count: usize,
}

#[derive(Default)]
struct HubState {
    closed: bool,
    clients: HashMap<ConnectionId, Arc<dyn Client>>,
    rooms: HashMap<RoomId, Arc<Room>>,
    client_rooms: HashMap<ConnectionId, HashSet<RoomId>>,
    subscriptions: HashMap<RoomId, Arc<RoomSubscription>>,
}

impl HubState {
    /// Drop `connection_id` from `room_id`. Returns the room's subscription
    /// if the room became empty and was removed.
    fn leave(&mut self, connection_id: &ConnectionId, room_id: &str) -> Option<Arc<RoomSubscription>> {
        if let Some(rooms) = self.client_rooms.get_mut(connection_id) {
            rooms.remove(room_id);
        }

        let room = Arc::clone(self.rooms.get(room_id)?);
        room.remove(connection_id);
        if !room.is_empty() {
            return None;
        }

        self.rooms.remove(room_id);
        debug!(room = %room_id, "Removed empty room");
        self.subscriptions.remove(room_id)
    }

    /// Drop the room fed by `handle` together with every membership in it.
    /// Returns the number of members dropped; zero if `handle` was already
    /// replaced or removed.
    fn abandon(&mut self, handle: &Arc<RoomSubscription>) -> usize {
        let room_id = handle.room_id();
        let current = self
            .subscriptions
            .get(room_id)
            .is_some_and(|existing| Arc::ptr_eq(existing, handle));
        if !current {
            return 0;
        }
        self.subscriptions.remove(room_id);

        let Some(room) = self.rooms.remove(room_id) else {
            return 0;
        };
        let members = room.member_ids();
        for id in &members {
            room.remove(id);
            if let Some(rooms) = self.client_rooms.get_mut(id) {
                rooms.remove(room_id);
            }
        }
        members.len()
    }

    /// Whether a client other than `client` holds its connection ID.
    fn id_taken(&self, client: &Arc<dyn Client>) -> bool {
        self.clients
            .get(client.id())
            .is_some_and(|existing| !Arc::ptr_eq(existing, client))
    }
}

struct HubInner {
    pubsub: Arc<dyn PubSub>,
    config: HubConfig,
    state: Mutex<HubState>,
    shutdown: CancellationToken,
    closing: AtomicBool,
}

/// Room membership and cross-process fan-out for one server process.
///
/// Cloning is cheap; every clone drives the same hub.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Create a hub publishing through `pubsub`.
    #[must_use]
    pub fn new(pubsub: Arc<dyn PubSub>) -> Self {
        Self::with_config(pubsub, HubConfig::default())
    }

    /// Create a hub with custom configuration.
    #[must_use]
    pub fn with_config(pubsub: Arc<dyn PubSub>, config: HubConfig) -> Self {
        info!(backend = pubsub.name(), prefix = %config.channel_prefix, "Creating hub");
        Self {
            inner: Arc::new(HubInner {
                pubsub,
                config,
                state: Mutex::new(HubState::default()),
                shutdown: CancellationToken::new(),
                closing: AtomicBool::new(false),
            }),
        }
    }

    /// Start tracking `client`.
    ///
    /// A connection ID is only reusable by the principal holding it: the
    /// previous holder is evicted when the principals match, otherwise the
    /// newcomer is rejected. A rejected client is closed.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] after [`Hub::close`] and
    /// [`HubError::ConnectionIdInUse`] if another principal holds the ID.
    pub fn register(&self, client: Arc<dyn Client>) -> Result<(), HubError> {
        let previous = {
            let state = self.state();
            if state.closed {
                drop(state);
                warn!(connection = %client.id(), "Hub closed, rejecting client");
                client.close();
                return Err(HubError::Closed);
            }
            state
                .clients
                .get(client.id())
                .filter(|existing| !Arc::ptr_eq(*existing, &client))
                .cloned()
        };

        if let Some(previous) = previous {
            if previous.principal_id() != client.principal_id() {
                warn!(
                    connection = %client.id(),
                    principal = %client.principal_id(),
                    holder = %previous.principal_id(),
                    "Connection ID held by another principal, rejecting client"
                );
                client.close();
                return Err(HubError::ConnectionIdInUse(client.id().clone()));
            }
            warn!(connection = %client.id(), "Connection ID reused, evicting previous client");
            self.unregister(&previous);
        }

        let registered = {
            let mut state = self.state();
            if state.closed {
                Err(HubError::Closed)
            } else if state.id_taken(&client) {
                Err(HubError::ConnectionIdInUse(client.id().clone()))
            } else {
                let id = client.id().clone();
                state.client_rooms.entry(id.clone()).or_default();
                state.clients.insert(id, Arc::clone(&client));
                Ok(state.clients.len())
            }
        };

        match registered {
            Ok(total) => {
                info!(
                    connection = %client.id(),
                    principal = %client.principal_id(),
                    connections = total,
                    "Client registered"
                );
                Ok(())
            }
            Err(e) => {
                client.close();
                Err(e)
            }
        }
    }

    /// Stop tracking `client`, leave all of its rooms and close it.
    ///
    /// Unknown clients are only closed.
    pub fn unregister(&self, client: &Arc<dyn Client>) {
        let detached = {
            let mut guard = self.state();
            let state = &mut *guard;

            let registered = state
                .clients
                .get(client.id())
                .is_some_and(|existing| Arc::ptr_eq(existing, client));
            if registered {
                state.clients.remove(client.id());
                let rooms = state.client_rooms.remove(client.id()).unwrap_or_default();
                let detached: Vec<_> = rooms
                    .iter()
                    .filter_map(|room_id| state.leave(client.id(), room_id))
                    .collect();
                Some(detached)
            } else {
                None
            }
        };

        let Some(detached) = detached else {
            client.close();
            return;
        };

        for subscription in &detached {
            self.release(subscription);
        }
        client.close();
        info!(connection = %client.id(), "Client unregistered");
    }

    /// Add `client` to `room_id`, subscribing to the room's channel on first
    /// local membership.
    ///
    /// Joiners arriving while the room's subscribe call is still in flight
    /// wait for its outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the room ID is invalid, the client or the hub is
    /// closed, or the subscription fails. A failed subscription drops the
    /// room and every membership recorded in it while it was pending.
    pub async fn join(&self, client: &Arc<dyn Client>, room_id: &str) -> Result<(), HubError> {
        let room_id = validate_room_id(room_id).map_err(HubError::InvalidRoomId)?;
        if client.is_closed() {
            return Err(HubError::ConnectionClosed(client.id().clone()));
        }

        let (handle, created) = {
            let mut guard = self.state();
            let state = &mut *guard;
            if state.closed {
                return Err(HubError::Closed);
            }
            if state.id_taken(client) {
                return Err(HubError::ConnectionIdInUse(client.id().clone()));
            }

            let id = client.id().clone();
            state
                .clients
                .entry(id.clone())
                .or_insert_with(|| Arc::clone(client));
            let room = Arc::clone(
                state
                    .rooms
                    .entry(room_id.to_string())
                    .or_insert_with(|| Arc::new(Room::new(room_id))),
            );
            room.add(client);
            state
                .client_rooms
                .entry(id)
                .or_default()
                .insert(room_id.to_string());

            match state.subscriptions.get(room_id) {
                Some(handle) => (Arc::clone(handle), false),
                None => {
                    let handle = Arc::new(RoomSubscription::new(
                        room_id,
                        self.channel_name(room_id),
                        self.inner.shutdown.child_token(),
                    ));
                    state
                        .subscriptions
                        .insert(room_id.to_string(), Arc::clone(&handle));
                    (handle, true)
                }
            }
        };

        if created {
            return self.subscribe_room(handle).await;
        }

        match handle.settled().await {
            SubscriptionState::Active => Ok(()),
            SubscriptionState::Failed(reason) => Err(HubError::Subscribe {
                channel: handle.channel().to_string(),
                source: PubSubError::Unavailable(reason),
            }),
            SubscriptionState::Pending | SubscriptionState::Closed if self.is_closed() => {
                Err(HubError::Closed)
            }
            SubscriptionState::Pending | SubscriptionState::Closed => {
                Err(HubError::ConnectionClosed(client.id().clone()))
            }
        }
    }

    /// Remove `client` from `room_id`. An emptied room is dropped together
    /// with its subscription. Leaving a room the client is not in is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the room ID is invalid.
    pub fn leave(&self, client: &Arc<dyn Client>, room_id: &str) -> Result<(), HubError> {
        let room_id = validate_room_id(room_id).map_err(HubError::InvalidRoomId)?;

        let detached = self.state().leave(client.id(), room_id);
        if let Some(subscription) = detached {
            self.release(&subscription);
        }
        Ok(())
    }

    /// Dispatch one envelope sent by `client`.
    ///
    /// # Errors
    ///
    /// Returns an error if the action is unsupported or the underlying
    /// operation fails.
    pub async fn handle_message(
        &self,
        client: &Arc<dyn Client>,
        envelope: Envelope,
    ) -> Result<(), HubError> {
        match envelope.action.clone() {
            Action::JoinRoom => self.join(client, &envelope.room_id).await,
            Action::LeaveRoom => self.leave(client, &envelope.room_id),
            Action::ChatMessage => self.publish_chat(client, envelope).await,
            Action::Unknown(action) => Err(HubError::UnsupportedAction(action)),
        }
    }

    /// Shut the hub down: stop every room subscription and close every
    /// connection. Idempotent.
    pub fn close(&self) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();

        let state = {
            let mut guard = self.state();
            let state = std::mem::take(&mut *guard);
            guard.closed = true;
            state
        };

        for subscription in state.subscriptions.values() {
            subscription.close();
        }
        for client in state.clients.values() {
            client.close();
        }

        info!(
            connections = state.clients.len(),
            subscriptions = state.subscriptions.len(),
            "Hub closed"
        );
    }

    /// Check if the hub was shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Get hub statistics.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        let state = self.state();
        HubStats {
            connection_count: state.clients.len(),
            room_count: state.rooms.len(),
            subscription_count: state.subscriptions.len(),
        }
    }

    /// Number of local members of `room_id`.
    #[must_use]
    pub fn room_member_count(&self, room_id: &str) -> usize {
        self.state()
            .rooms
            .get(room_id)
            .map_or(0, |room| room.member_count())
    }

    /// Check if `room_id` exists.
    #[must_use]
    pub fn room_exists(&self, room_id: &str) -> bool {
        self.state().rooms.contains_key(room_id)
    }

    /// Check if `room_id` has an active or pending subscription.
    #[must_use]
    pub fn has_subscription(&self, room_id: &str) -> bool {
        self.state().subscriptions.contains_key(room_id)
    }

    /// Rooms joined by `connection_id`, or `None` if it is not registered.
    #[must_use]
    pub fn joined_rooms(&self, connection_id: &ConnectionId) -> Option<Vec<RoomId>> {
        let state = self.state();
        let mut rooms: Vec<RoomId> = state.client_rooms.get(connection_id)?.iter().cloned().collect();
        rooms.sort();
        Some(rooms)
    }

    /// Channel name for `room_id`.
    #[must_use]
    pub fn channel_name(&self, room_id: &str) -> String {
        format!("{}{}", self.inner.config.channel_prefix, room_id)
    }

    async fn publish_chat(&self, client: &Arc<dyn Client>, mut envelope: Envelope) -> Result<(), HubError> {
        if self.is_closed() {
            return Err(HubError::Closed);
        }

        envelope.room_id = validate_room_id(&envelope.room_id)
            .map_err(HubError::InvalidRoomId)?
            .to_string();
        if envelope.sender_id.is_empty() {
            envelope.sender_id = client.principal_id().to_string();
        }
        if envelope.sender_id.is_empty() {
            envelope.sender_id = client.id().to_string();
        }

        let payload = codec::encode(&envelope)?;
        let channel = self.channel_name(&envelope.room_id);
        self.inner
            .pubsub
            .publish(&channel, payload)
            .await
            .map_err(|source| HubError::Publish {
                channel: channel.clone(),
                source,
            })?;

        debug!(
            connection = %client.id(),
            room = %envelope.room_id,
            sender = %envelope.sender_id,
            "Published chat message"
        );
        Ok(())
    }

    /// Subscribe the pending `handle` and start its consumer task.
    async fn subscribe_room(&self, handle: Arc<RoomSubscription>) -> Result<(), HubError> {
        let channel = handle.channel().to_string();

        match self.inner.pubsub.subscribe(&channel).await {
            Ok(listener) => {
                if handle.activate() {
                    info!(room = %handle.room_id(), channel = %channel, "Subscribed to room channel");
                }
                tokio::spawn(self.clone().consume(handle, listener));
                Ok(())
            }
            Err(source) => {
                let dropped = self.state().abandon(&handle);
                handle.fail(source.to_string());
                handle.close();
                warn!(
                    room = %handle.room_id(),
                    channel = %channel,
                    members = dropped,
                    error = %source,
                    "Room subscription failed, room dropped"
                );
                Err(HubError::Subscribe { channel, source })
            }
        }
    }

    /// Forward everything received on a room's channel to its local members.
    async fn consume(self, handle: Arc<RoomSubscription>, mut listener: Box<dyn Subscription>) {
        loop {
            tokio::select! {
                biased;

                _ = handle.cancelled() => break,
                message = listener.recv() => match message {
                    Some(payload) => self.broadcast_local(handle.room_id(), &payload),
                    None => {
                        warn!(room = %handle.room_id(), channel = %handle.channel(), "Room channel closed by backend");
                        break;
                    }
                },
            }
        }

        self.remove_subscription(&handle);
        handle.close();
        if let Err(e) = listener.close().await {
            warn!(room = %handle.room_id(), error = %e, "Failed to release room subscription");
        }
        debug!(room = %handle.room_id(), "Room subscription closed");
    }

    fn broadcast_local(&self, room_id: &str, payload: &Bytes) {
        let room = self.state().rooms.get(room_id).cloned();
        match room {
            Some(room) => {
                room.broadcast(payload);
            }
            None => trace!(room = %room_id, "Dropping message for room without local members"),
        }
    }

    /// Remove `handle` from the table unless it was already replaced.
    fn remove_subscription(&self, handle: &Arc<RoomSubscription>) {
        let mut state = self.state();
        let current = state
            .subscriptions
            .get(handle.room_id())
            .is_some_and(|existing| Arc::ptr_eq(existing, handle));
        if current {
            state.subscriptions.remove(handle.room_id());
        }
    }

    fn release(&self, subscription: &RoomSubscription) {
        if subscription.close() {
            debug!(room = %subscription.room_id(), channel = %subscription.channel(), "Unsubscribed from room channel");
        }
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("backend", &self.inner.pubsub.name())
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

#[async_trait]
impl Dispatcher for Hub {
    fn unregister(&self, client: &Arc<dyn Client>) {
        Hub::unregister(self, client);
    }

    async fn handle_message(
        &self,
        client: &Arc<dyn Client>,
        envelope: Envelope,
    ) -> Result<(), HubError> {
        Hub::handle_message(self, client, envelope).await
    }
}
