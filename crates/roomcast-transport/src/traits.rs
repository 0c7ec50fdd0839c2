//! Socket abstraction traits for Roomcast.
//!
//! A client socket is split into a [`FrameSink`] owned by the connection's
//! write loop and a [`FrameStream`] owned by its read loop, so neither half is
//! ever shared between tasks.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Use the client-supplied ID when present, otherwise generate one.
    #[must_use]
    pub fn from_client(requested: Option<&str>) -> Self {
        match requested.map(str::trim) {
            Some(id) if !id.is_empty() => Self::new(id),
            _ => Self::generate(),
        }
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A read or write deadline passed.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] roomcast_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single message-level frame on a client socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Bytes),
    /// Keepalive probe.
    Ping(Bytes),
    /// Keepalive acknowledgment.
    Pong(Bytes),
    /// Close handshake.
    Close,
}

impl WireFrame {
    /// Frame an outbound payload: text when it is valid UTF-8, binary otherwise.
    #[must_use]
    pub fn from_payload(payload: Bytes) -> Self {
        match std::str::from_utf8(&payload) {
            Ok(text) => WireFrame::Text(text.to_owned()),
            Err(_) => WireFrame::Binary(payload),
        }
    }

    /// Empty ping frame.
    #[must_use]
    pub fn ping() -> Self {
        WireFrame::Ping(Bytes::new())
    }

    /// Data carried by a text or binary frame.
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            WireFrame::Text(text) => Some(text.as_bytes()),
            WireFrame::Binary(data) => Some(data),
            _ => None,
        }
    }
}

/// The writing half of a client socket.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame.
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError>;

    /// Close the underlying socket.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// The reading half of a client socket.
#[async_trait]
pub trait FrameStream: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` if the peer went away cleanly.
    async fn next_frame(&mut self) -> Result<Option<WireFrame>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate();
        let id2 = ConnectionId::generate();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().len(), 36);
    }

    #[test]
    fn test_connection_id_from_client() {
        assert_eq!(ConnectionId::from_client(Some("tab-1")).as_str(), "tab-1");
        assert_ne!(ConnectionId::from_client(Some("  ")).as_str(), "  ");
        assert!(!ConnectionId::from_client(None).as_str().is_empty());
    }

    #[test]
    fn test_wire_frame_from_payload() {
        assert_eq!(
            WireFrame::from_payload(Bytes::from_static(b"{\"a\":1}")),
            WireFrame::Text("{\"a\":1}".to_string())
        );
        assert_eq!(
            WireFrame::from_payload(Bytes::from_static(&[0xff, 0xfe])),
            WireFrame::Binary(Bytes::from_static(&[0xff, 0xfe]))
        );
        assert_eq!(WireFrame::ping().data(), None);
    }
}
