//! Metrics collection and export for Roomcast.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use roomcast_core::{Client, Dispatcher, Hub, HubError};
use roomcast_protocol::{Action, Envelope};
use roomcast_transport::{FrameSink, FrameStream, TransportError, WireFrame};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "roomcast_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "roomcast_connections_active";
    pub const MESSAGES_TOTAL: &str = "roomcast_messages_total";
    pub const MESSAGES_BYTES: &str = "roomcast_messages_bytes";
    pub const ROOMS_ACTIVE: &str = "roomcast_rooms_active";
    pub const SUBSCRIPTIONS_ACTIVE: &str = "roomcast_subscriptions_active";
    pub const CHAT_PUBLISHED_TOTAL: &str = "roomcast_chat_published_total";
    pub const ERRORS_TOTAL: &str = "roomcast_errors_total";
}

/// How often hub statistics are sampled into gauges.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open WebSocket connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of data frames");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of data frames");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Rooms with local members");
    metrics::describe_gauge!(
        names::SUBSCRIPTIONS_ACTIVE,
        "Room channels this process is subscribed to"
    );
    metrics::describe_counter!(
        names::CHAT_PUBLISHED_TOTAL,
        "Chat messages published to room channels"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(host: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid metrics address: {}:{}", host, port))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a data frame.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

/// Sample hub statistics into gauges until `cancel` fires.
pub fn spawn_stats_sampler(hub: Hub, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATS_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let stats = hub.stats();
                    gauge!(names::ROOMS_ACTIVE).set(stats.room_count as f64);
                    gauge!(names::SUBSCRIPTIONS_ACTIVE).set(stats.subscription_count as f64);
                }
            }
        }
    });
}

/// Counts inbound data frames.
pub struct MeteredStream<S> {
    inner: S,
}

impl<S> MeteredStream<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: FrameStream> FrameStream for MeteredStream<S> {
    async fn next_frame(&mut self) -> Result<Option<WireFrame>, TransportError> {
        let result = self.inner.next_frame().await;
        match &result {
            Ok(Some(frame)) => {
                if let Some(data) = frame.data() {
                    record_message(data.len(), "inbound");
                }
            }
            Ok(None) => {}
            Err(TransportError::Protocol(_)) => record_error("frame_too_large"),
            Err(_) => record_error("websocket_read"),
        }
        result
    }
}

/// Counts outbound data frames.
pub struct MeteredSink<S> {
    inner: S,
}

impl<S> MeteredSink<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: FrameSink> FrameSink for MeteredSink<S> {
    async fn send(&mut self, frame: WireFrame) -> Result<(), TransportError> {
        let bytes = frame.data().map(<[u8]>::len);
        let result = self.inner.send(frame).await;
        match (&result, bytes) {
            (Ok(()), Some(bytes)) => record_message(bytes, "outbound"),
            (Ok(()), None) => {}
            (Err(_), _) => record_error("websocket_write"),
        }
        result
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}

/// Counts dispatch outcomes in front of a [`Hub`].
pub struct MeteredDispatcher {
    hub: Hub,
}

impl MeteredDispatcher {
    pub fn new(hub: Hub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Dispatcher for MeteredDispatcher {
    fn unregister(&self, client: &Arc<dyn Client>) {
        self.hub.unregister(client);
    }

    async fn handle_message(
        &self,
        client: &Arc<dyn Client>,
        envelope: Envelope,
    ) -> Result<(), HubError> {
        let is_chat = envelope.action == Action::ChatMessage;
        let result = self.hub.handle_message(client, envelope).await;
        match &result {
            Ok(()) if is_chat => counter!(names::CHAT_PUBLISHED_TOTAL).increment(1),
            Ok(()) => {}
            Err(e) => record_error(error_kind(e)),
        }
        result
    }
}

fn error_kind(error: &HubError) -> &'static str {
    match error {
        HubError::InvalidRoomId(_) => "invalid_room_id",
        HubError::Closed => "hub_closed",
        HubError::ConnectionClosed(_) => "connection_closed",
        HubError::ConnectionIdInUse(_) => "connection_id_in_use",
        HubError::UnsupportedAction(_) => "unsupported_action",
        HubError::Protocol(_) => "protocol",
        HubError::Subscribe { .. } => "subscribe",
        HubError::Publish { .. } => "publish",
    }
}
