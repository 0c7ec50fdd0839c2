//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum [`WebSocket`] to the [`FrameSink`] / [`FrameStream`]
//! pair used by connection read and write loops.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use roomcast_protocol::ProtocolError;
use tracing::{debug, warn};

use crate::traits::{FrameSink, FrameStream, TransportError, WireFrame};

/// Split an upgraded socket into its writing and reading halves.
///
/// Text and binary frames larger than `max_frame_size` are reported as a
/// protocol error by the reading half.
#[must_use]
pub fn split(socket: WebSocket, max_frame_size: usize) -> (WebSocketSink, WebSocketStream) {
    let (sink, stream) = socket.split();
    (
        WebSocketSink { inner: sink },
        WebSocketStream {
            inner: stream,
            max_frame_size,
        },
    )
}

/// Writing half of an axum WebSocket.
pub struct WebSocketSink {
    inner: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        let message = match frame {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Binary(data) => Message::Binary(data.to_vec()),
            WireFrame::Ping(data) => Message::Ping(data.to_vec()),
            WireFrame::Pong(data) => Message::Pong(data.to_vec()),
            WireFrame::Close => Message::Close(None),
        };
        self.inner
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(format!("Failed to close: {}", e)))
    }
}

/// Reading half of an axum WebSocket.
pub struct WebSocketStream {
    inner: SplitStream<WebSocket>,
    max_frame_size: usize,
}

impl WebSocketStream {
    fn check_size(&self, len: usize) -> Result<(), TransportError> {
        if len > self.max_frame_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                len, self.max_frame_size
            );
            return Err(TransportError::Protocol(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl FrameStream for WebSocketStream {
    async fn next_frame(&mut self) -> Result<Option<WireFrame>, TransportError> {
        match self.inner.next().await {
            Some(Ok(Message::Text(text))) => {
                self.check_size(text.len())?;
                Ok(Some(WireFrame::Text(text)))
            }
            Some(Ok(Message::Binary(data))) => {
                self.check_size(data.len())?;
                Ok(Some(WireFrame::Binary(Bytes::from(data))))
            }
            Some(Ok(Message::Ping(data))) => Ok(Some(WireFrame::Ping(Bytes::from(data)))),
            Some(Ok(Message::Pong(data))) => Ok(Some(WireFrame::Pong(Bytes::from(data)))),
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "Received close frame");
                Ok(Some(WireFrame::Close))
            }
            Some(Err(e)) => Err(TransportError::ReceiveFailed(e.to_string())),
            None => {
                debug!("WebSocket stream ended");
                Ok(None)
            }
        }
    }
}
