//! Capability traits at the seams between connections, rooms and the hub.
//!
//! Rooms and the hub only ever see a connection as a [`Client`], and a
//! connection's read loop only ever sees the hub as a [`Dispatcher`], so
//! either side can be replaced by a test double.

use async_trait::async_trait;
use bytes::Bytes;
use roomcast_protocol::Envelope;
use roomcast_transport::ConnectionId;
use std::sync::Arc;

use crate::hub::HubError;

/// A live client session as seen by rooms and the hub.
pub trait Client: Send + Sync {
    /// Connection identifier.
    fn id(&self) -> &ConnectionId;

    /// Authenticated principal behind the connection.
    fn principal_id(&self) -> &str;

    /// Queue `payload` for delivery. Never blocks; a no-op once closed.
    fn send(&self, payload: Bytes);

    /// Close the session. Idempotent.
    fn close(&self);

    /// Whether the session has started closing.
    fn is_closed(&self) -> bool;
}

/// The hub operations a connection needs.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Forget a client, leaving all of its rooms, and close it.
    fn unregister(&self, client: &Arc<dyn Client>);

    /// Interpret one decoded envelope sent by `client`.
    async fn handle_message(
        &self,
        client: &Arc<dyn Client>,
        envelope: Envelope,
    ) -> Result<(), HubError>;
}
