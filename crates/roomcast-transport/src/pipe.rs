//! In-process socket.
//!
//! [`pipe`] returns a connected sink/stream pair plus the [`PipePeer`] that
//! plays the remote client. Useful for driving connection loops without a
//! network, and for embedding a hub behind a non-WebSocket front end.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::traits::{FrameSink, FrameStream, TransportError, WireFrame};

/// Create an in-process socket whose directions each buffer `capacity` frames.
#[must_use]
pub fn pipe(capacity: usize) -> (PipeSink, PipeStream, PipePeer) {
    let (out_tx, out_rx) = mpsc::channel(capacity);
    let (in_tx, in_rx) = mpsc::channel(capacity);
    let close_count = Arc::new(AtomicUsize::new(0));

    (
        PipeSink {
            tx: out_tx,
            closed: false,
            close_count: Arc::clone(&close_count),
        },
        PipeStream { rx: in_rx },
        PipePeer {
            inbound: Some(in_tx),
            outbound: out_rx,
            close_count,
        },
    )
}

/// Server-side writing half of a pipe.
pub struct PipeSink {
    tx: mpsc::Sender<WireFrame>,
    closed: bool,
    close_count: Arc<AtomicUsize>,
}

#[async_trait]
impl FrameSink for PipeSink {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed = true;
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Server-side reading half of a pipe.
pub struct PipeStream {
    rx: mpsc::Receiver<Result<WireFrame, TransportError>>,
}

#[async_trait]
impl FrameStream for PipeStream {
    async fn next_frame(&mut self) -> Result<Option<WireFrame>, TransportError> {
        match self.rx.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// The remote end of a pipe.
pub struct PipePeer {
    inbound: Option<mpsc::Sender<Result<WireFrame, TransportError>>>,
    outbound: mpsc::Receiver<WireFrame>,
    close_count: Arc<AtomicUsize>,
}

impl PipePeer {
    /// Deliver a frame to the server side.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side stopped reading or the peer hung up.
    pub async fn send(&self, frame: WireFrame) -> Result<(), TransportError> {
        self.deliver(Ok(frame)).await
    }

    /// Deliver a text frame to the server side.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side stopped reading or the peer hung up.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.send(WireFrame::Text(text.into())).await
    }

    /// Make the server side's next read fail with `error`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server side stopped reading or the peer hung up.
    pub async fn fail(&self, error: TransportError) -> Result<(), TransportError> {
        self.deliver(Err(error)).await
    }

    /// End the stream as if the peer went away cleanly.
    pub fn hang_up(&mut self) {
        self.inbound = None;
    }

    /// Receive the next frame the server wrote.
    ///
    /// Returns `None` once the server side dropped its sink.
    pub async fn recv(&mut self) -> Option<WireFrame> {
        self.outbound.recv().await
    }

    /// Take a frame the server already wrote, without waiting.
    pub fn try_recv(&mut self) -> Option<WireFrame> {
        self.outbound.try_recv().ok()
    }

    /// How many times the server closed its sink.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    async fn deliver(&self, item: Result<WireFrame, TransportError>) -> Result<(), TransportError> {
        let inbound = self.inbound.as_ref().ok_or(TransportError::ConnectionClosed)?;
        inbound
            .send(item)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pipe_roundtrip() {
        let (mut sink, mut stream, mut peer) = pipe(4);

        peer.send_text("hello").await.unwrap();
        assert_eq!(
            stream.next_frame().await.unwrap(),
            Some(WireFrame::Text("hello".to_string()))
        );

        sink.send(WireFrame::ping()).await.unwrap();
        assert_eq!(peer.recv().await, Some(WireFrame::ping()));
    }

    #[tokio::test]
    async fn test_pipe_hang_up_and_failure() {
        let (_sink, mut stream, mut peer) = pipe(4);

        peer.fail(TransportError::ReceiveFailed("reset".into()))
            .await
            .unwrap();
        assert!(matches!(
            stream.next_frame().await,
            Err(TransportError::ReceiveFailed(_))
        ));

        peer.hang_up();
        assert!(stream.next_frame().await.unwrap().is_none());
        assert!(peer.send_text("late").await.is_err());
    }

    #[tokio::test]
    async fn test_pipe_close_counts() {
        let (mut sink, _stream, peer) = pipe(1);

        sink.close().await.unwrap();
        assert_eq!(peer.close_count(), 1);
        assert!(matches!(
            sink.send(WireFrame::Close).await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
