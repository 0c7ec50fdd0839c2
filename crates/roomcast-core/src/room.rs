//! Room abstraction for Roomcast.
//!
//! A room is the set of local connections interested in one topic. Members
//! are held weakly: a room never keeps a connection alive.

use bytes::Bytes;
use roomcast_protocol::RoomId;
use roomcast_transport::ConnectionId;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use tracing::{debug, trace};

use crate::traits::Client;

/// Local members of one room.
pub struct Room {
    /// Room ID.
    id: RoomId,
    /// Members by connection ID.
    members: RwLock<HashMap<ConnectionId, Weak<dyn Client>>>,
}

impl Room {
    /// Create an empty room.
    #[must_use]
    pub fn new(id: impl Into<RoomId>) -> Self {
        Self {
            id: id.into(),
            members: RwLock::new(HashMap::new()),
        }
    }

    /// Get the room ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add a member.
    ///
    /// Returns `true` if the client was not already a member.
    pub fn add(&self, client: &Arc<dyn Client>) -> bool {
        let (added, total) = {
            let mut members = self.write();
            let added = members
                .insert(client.id().clone(), Arc::downgrade(client))
                .is_none();
            (added, members.len())
        };
        debug!(room = %self.id, connection = %client.id(), members = total, "Client joined room");
        added
    }

    /// Remove a member.
    ///
    /// Returns `true` if the client was a member.
    pub fn remove(&self, connection_id: &ConnectionId) -> bool {
        let (removed, total) = {
            let mut members = self.write();
            let removed = members.remove(connection_id).is_some();
            (removed, members.len())
        };
        if removed {
            debug!(room = %self.id, connection = %connection_id, members = total, "Client left room");
        }
        removed
    }

    /// Send `payload` to every live member.
    ///
    /// Members are snapshotted under the lock and sent to outside it, so a
    /// slow or closing member never blocks membership changes.
    ///
    /// Returns the number of members the payload was handed to.
    pub fn broadcast(&self, payload: &Bytes) -> usize {
        let snapshot: Vec<Arc<dyn Client>> = self
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .collect();

        for client in &snapshot {
            client.send(payload.clone());
        }

        trace!(room = %self.id, recipients = snapshot.len(), "Broadcast message");
        snapshot.len()
    }

    /// Check if a connection is a member.
    #[must_use]
    pub fn contains(&self, connection_id: &ConnectionId) -> bool {
        self.read().contains_key(connection_id)
    }

    /// Get the number of members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.read().len()
    }

    /// Check if the room has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.member_count() == 0
    }

    /// Get all member IDs.
    #[must_use]
    pub fn member_ids(&self) -> Vec<ConnectionId> {
        self.read().keys().cloned().collect()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Weak<dyn Client>>> {
        self.members.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, Weak<dyn Client>>> {
        self.members.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("members", &self.member_count())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// A client that records everything sent to it.
    pub(crate) struct RecordingClient {
        id: ConnectionId,
        principal: String,
        sent: Mutex<Vec<Bytes>>,
        closed: AtomicBool,
    }

    impl RecordingClient {
        pub(crate) fn new(id: &str, principal: &str) -> Arc<Self> {
            Arc::new(Self {
                id: ConnectionId::new(id),
                principal: principal.to_string(),
                sent: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            })
        }

        pub(crate) fn sent(&self) -> Vec<Bytes> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Client for RecordingClient {
        fn id(&self) -> &ConnectionId {
            &self.id
        }

        fn principal_id(&self) -> &str {
            &self.principal
        }

        fn send(&self, payload: Bytes) {
            if !self.is_closed() {
                self.sent.lock().unwrap().push(payload);
            }
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn as_client(client: &Arc<RecordingClient>) -> Arc<dyn Client> {
        Arc::clone(client) as Arc<dyn Client>
    }

    #[test]
    fn test_room_creation() {
        let room = Room::new("general");
        assert_eq!(room.id(), "general");
        assert_eq!(room.member_count(), 0);
        assert!(room.is_empty());
    }

    #[test]
    fn test_room_add_remove_idempotent() {
        let room = Room::new("general");
        let c1 = as_client(&RecordingClient::new("c1", "u1"));
        let c2 = as_client(&RecordingClient::new("c2", "u2"));

        assert!(room.add(&c1));
        assert!(!room.add(&c1));
        assert!(room.add(&c2));
        assert_eq!(room.member_count(), 2);
        assert!(room.contains(c1.id()));

        assert!(room.remove(c1.id()));
        assert!(!room.remove(c1.id()));
        assert_eq!(room.member_ids(), vec![ConnectionId::new("c2")]);

        assert!(room.remove(c2.id()));
        assert!(room.is_empty());
    }

    #[test]
    fn test_room_broadcast() {
        let room = Room::new("general");
        let c1 = RecordingClient::new("c1", "u1");
        let c2 = RecordingClient::new("c2", "u2");
        room.add(&as_client(&c1));
        room.add(&as_client(&c2));

        let count = room.broadcast(&Bytes::from_static(b"hello"));
        assert_eq!(count, 2);
        assert_eq!(c1.sent(), vec![Bytes::from_static(b"hello")]);
        assert_eq!(c2.sent(), vec![Bytes::from_static(b"hello")]);
    }

    #[test]
    fn test_room_does_not_own_members() {
        let room = Room::new("general");
        let c1 = as_client(&RecordingClient::new("c1", "u1"));
        room.add(&c1);
        drop(c1);

        // The entry stays until removed, but nothing is delivered to it.
        assert_eq!(room.member_count(), 1);
        assert_eq!(room.broadcast(&Bytes::from_static(b"hello")), 0);
    }
}
