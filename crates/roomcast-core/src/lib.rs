//! # roomcast-core
//!
//! Connection, room and hub coordination for the Roomcast chat hub.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Connection** - One client session with its read and write loops
//! - **Room** - The local members of one chat room
//! - **Hub** - Membership bookkeeping and cross-process fan-out
//! - **RoomSubscription** - The hub's handle on a room's external channel
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  envelope  ┌─────────────┐  publish   ┌─────────────┐
//! │  Connection │───────────▶│     Hub     │───────────▶│   PubSub    │
//! └─────────────┘            └─────────────┘            └─────────────┘
//!        ▲                          │                          │
//!        │ send                     ▼                          │ subscription
//!        │                   ┌─────────────┐    consume        │
//!        └───────────────────│    Room     │◀──────────────────┘
//!                            └─────────────┘
//! ```

pub mod connection;
pub mod hub;
pub mod room;
pub mod subscription;
pub mod traits;

pub use connection::{Connection, ConnectionConfig, ConnectionState};
pub use hub::{Hub, HubConfig, HubError, HubStats, DEFAULT_CHANNEL_PREFIX};
pub use room::Room;
pub use subscription::{RoomSubscription, SubscriptionState};
pub use traits::{Client, Dispatcher};
