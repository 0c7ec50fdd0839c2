//! Client connection lifecycle.
//!
//! A [`Connection`] owns one client socket through two loops:
//!
//! - [`Connection::read_loop`] decodes inbound frames and hands envelopes to
//!   the hub. It runs on the upgrade task and unregisters the connection when
//!   it ends.
//! - [`Connection::write_loop`] drains the bounded outbound buffer, sends
//!   keepalive pings and closes the socket when it ends.
//!
//! Everything destined for the client goes through [`Client::send`], which
//! never blocks: a client that lets its buffer fill up is disconnected.

use bytes::Bytes;
use roomcast_protocol::codec;
use roomcast_transport::{ConnectionId, FrameSink, FrameStream, TransportError, WireFrame};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::traits::{Client, Dispatcher};

/// Connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Deadline for a single socket write.
    pub write_timeout: Duration,
    /// How long the peer may stay silent before the connection is dropped.
    /// Extended by every pong.
    pub read_timeout: Duration,
    /// Ping period. Must be shorter than `read_timeout`.
    pub ping_interval: Duration,
    /// Outbound buffer capacity, in messages.
    pub send_buffer_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        let read_timeout = Duration::from_secs(60);
        Self {
            write_timeout: Duration::from_secs(10),
            read_timeout,
            ping_interval: read_timeout * 9 / 10,
            send_buffer_capacity: 256,
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Accepting outbound messages.
    Open = 0,
    /// Outbound buffer closed; the write loop is draining it.
    Closing = 1,
    /// Socket released.
    Closed = 2,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// One client's live session.
pub struct Connection {
    id: ConnectionId,
    principal_id: String,
    config: ConnectionConfig,
    /// Producer side of the outbound buffer. `None` once closed.
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    /// Consumer side, until the write loop claims it.
    pending_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    state: AtomicU8,
    /// Cancelled by `close` to stop the read loop.
    closed: CancellationToken,
}

impl Connection {
    /// Create a connection for an authenticated principal.
    #[must_use]
    pub fn new(
        id: ConnectionId,
        principal_id: impl Into<String>,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.send_buffer_capacity.max(1));
        Arc::new(Self {
            id,
            principal_id: principal_id.into(),
            config,
            outbound: Mutex::new(Some(tx)),
            pending_rx: Mutex::new(Some(rx)),
            state: AtomicU8::new(ConnectionState::Open as u8),
            closed: CancellationToken::new(),
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::SeqCst))
    }

    /// Connection tuning.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Read frames until the socket, the connection or `cancel` ends, then
    /// unregister from `hub`.
    pub async fn read_loop<S: FrameStream>(
        self: Arc<Self>,
        mut stream: S,
        hub: &dyn Dispatcher,
        cancel: CancellationToken,
    ) {
        let client: Arc<dyn Client> = self.clone();
        let mut deadline = Instant::now() + self.config.read_timeout;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(connection = %self.id, "Stopping read loop due to cancellation");
                    break;
                }
                _ = self.closed.cancelled() => {
                    debug!(connection = %self.id, "Stopping read loop, connection closed");
                    break;
                }
                result = tokio::time::timeout_at(deadline, stream.next_frame()) => result,
            };

            let frame = match result {
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => {
                    info!(connection = %self.id, "WebSocket connection closed while reading");
                    break;
                }
                Ok(Err(e)) => {
                    warn!(connection = %self.id, error = %e, "WebSocket read error");
                    break;
                }
                Err(_) => {
                    info!(connection = %self.id, "Read deadline exceeded");
                    break;
                }
            };

            let payload = match frame {
                WireFrame::Text(text) => Bytes::from(text),
                WireFrame::Binary(data) => data,
                WireFrame::Pong(_) => {
                    deadline = Instant::now() + self.config.read_timeout;
                    continue;
                }
                WireFrame::Ping(_) => continue,
                WireFrame::Close => {
                    debug!(connection = %self.id, "Received close frame");
                    break;
                }
            };

            let mut envelope = match codec::decode(&payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(connection = %self.id, error = %e, "Invalid websocket payload");
                    continue;
                }
            };
            if envelope.sender_id.is_empty() {
                envelope.sender_id = self.principal_id.clone();
            }

            let action = envelope.action.clone();
            let room_id = envelope.room_id.clone();
            if let Err(e) = hub.handle_message(&client, envelope).await {
                error!(
                    connection = %self.id,
                    action = %action,
                    room = %room_id,
                    error = %e,
                    "Failed to handle websocket message"
                );
            }
        }

        hub.unregister(&client);
    }

    /// Drain the outbound buffer into `sink` and keep the peer alive with
    /// pings, until the buffer closes, a write fails or `cancel` fires.
    pub async fn write_loop<S: FrameSink>(self: Arc<Self>, mut sink: S, cancel: CancellationToken) {
        let Some(mut rx) = self.take_receiver() else {
            debug!(connection = %self.id, "Write loop not started, connection already closed");
            return;
        };

        let period = self.config.ping_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(connection = %self.id, "Stopping write loop due to cancellation");
                    break;
                }
                message = rx.recv() => match message {
                    Some(payload) => {
                        if let Err(e) = self.write(&mut sink, WireFrame::from_payload(payload)).await {
                            error!(connection = %self.id, error = %e, "Failed to write websocket message");
                            break;
                        }
                    }
                    None => {
                        let _ = self.write(&mut sink, WireFrame::Close).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.write(&mut sink, WireFrame::ping()).await {
                        info!(connection = %self.id, error = %e, "Failed to write websocket ping");
                        break;
                    }
                }
            }
        }

        self.close();
        if let Err(e) = sink.close().await {
            debug!(connection = %self.id, error = %e, "Error while closing websocket connection");
        }
        self.state
            .store(ConnectionState::Closed as u8, Ordering::SeqCst);
    }

    async fn write<S: FrameSink>(&self, sink: &mut S, frame: WireFrame) -> Result<(), TransportError> {
        tokio::time::timeout(self.config.write_timeout, sink.send(frame))
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    fn take_receiver(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.pending_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::Sender<Bytes>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Client for Connection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn principal_id(&self) -> &str {
        &self.principal_id
    }

    fn send(&self, payload: Bytes) {
        if payload.is_empty() {
            return;
        }

        let overflow = match self.outbound().as_ref() {
            Some(tx) => matches!(tx.try_send(payload), Err(TrySendError::Full(_))),
            None => false,
        };

        if overflow {
            warn!(
                connection = %self.id,
                principal = %self.principal_id,
                "Client send buffer is full, closing connection"
            );
            self.close();
        }
    }

    fn close(&self) {
        // Taking the sender under the lock makes this run once.
        let Some(sender) = self.outbound().take() else {
            return;
        };
        let _ = self.state.compare_exchange(
            ConnectionState::Open as u8,
            ConnectionState::Closing as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        drop(sender);
        self.closed.cancel();

        // Nobody will drain a buffer the write loop never claimed.
        if self.take_receiver().is_some() {
            self.state
                .store(ConnectionState::Closed as u8, Ordering::SeqCst);
        }

        debug!(connection = %self.id, "Connection closed");
    }

    fn is_closed(&self) -> bool {
        self.state() != ConnectionState::Open
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("principal_id", &self.principal_id)
            .field("state", &self.state())
            .finish()
    }
}
