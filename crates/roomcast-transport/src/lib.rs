//! # roomcast-transport
//!
//! Transport abstraction layer for the Roomcast chat hub.
//!
//! Two kinds of transport meet in a hub:
//!
//! - **Client sockets** - one WebSocket per client, split into a
//!   [`FrameSink`] and a [`FrameStream`]
//! - **External pub/sub** - the cross-process fan-out channel behind the
//!   [`PubSub`] trait, backed by Redis or by process memory
//!
//! ```rust,ignore
//! use roomcast_transport::{FrameStream, WireFrame};
//!
//! async fn drain(mut stream: impl FrameStream) {
//!     while let Ok(Some(frame)) = stream.next_frame().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod memory;
pub mod pipe;
pub mod pubsub;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryPubSub;
pub use pipe::{pipe, PipePeer, PipeSink, PipeStream};
pub use pubsub::{PubSub, PubSubError, Subscription};
pub use traits::{ConnectionId, FrameSink, FrameStream, TransportError, WireFrame};

#[cfg(feature = "redis")]
pub use self::redis::RedisPubSub;
