//! # roomcast-protocol
//!
//! Wire protocol definitions for the Roomcast chat hub.
//!
//! Clients and server processes exchange JSON envelopes. The same bytes travel
//! over client WebSockets and over the external pub/sub channel.
//!
//! ## Actions
//!
//! - `JOIN_ROOM` / `LEAVE_ROOM` - Room membership
//! - `CHAT_MESSAGE` - Fan a payload out to every member of a room
//!
//! ## Example
//!
//! ```rust
//! use roomcast_protocol::{codec, Action, Envelope};
//!
//! let envelope = Envelope::join("general").with_sender("user-1");
//!
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(decoded.action, Action::JoinRoom);
//! ```

pub mod codec;
pub mod envelope;

pub use codec::{decode, encode, ProtocolError, DEFAULT_MAX_FRAME_SIZE};
pub use envelope::{validate_room_id, Action, Envelope, RoomId, MAX_ROOM_ID_LENGTH};
