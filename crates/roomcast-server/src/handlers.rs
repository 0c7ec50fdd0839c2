//! Connection handlers for the Roomcast server.
//!
//! This module wires the HTTP surface: the authenticated WebSocket endpoint,
//! the health check and graceful shutdown.

use crate::auth::{require_principal, Authenticator, Principal, StaticTokenAuthenticator};
use crate::config::{Config, PubSubBackend};
use crate::metrics::{self, ConnectionMetricsGuard, MeteredDispatcher, MeteredSink, MeteredStream};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Extension, Query, State,
    },
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use roomcast_core::{Connection, Hub};
use roomcast_transport::{websocket, ConnectionId, MemoryPubSub, PubSub, RedisPubSub};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The connection hub.
    pub hub: Hub,
    /// Server configuration.
    pub config: Config,
    /// Resolves bearer tokens on the WebSocket endpoint.
    pub authenticator: Arc<dyn Authenticator>,
    /// Cancelled when the server shuts down.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(hub: Hub, config: Config, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            hub,
            config,
            authenticator,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Connect the configured pub/sub backend.
///
/// # Errors
///
/// Returns an error if the backend cannot be reached.
pub async fn connect_pubsub(config: &Config) -> Result<Arc<dyn PubSub>> {
    match config.pubsub.backend {
        PubSubBackend::Memory => {
            info!("Using in-memory pub/sub; rooms are not shared across processes");
            Ok(Arc::new(MemoryPubSub::new()))
        }
        PubSubBackend::Redis => {
            let url = config
                .pubsub
                .url
                .as_deref()
                .context("pubsub.url is required for the redis backend")?;
            let pubsub = RedisPubSub::connect(url)
                .await
                .context("Failed to connect to Redis")?;
            Ok(Arc::new(pubsub))
        }
    }
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let pubsub = connect_pubsub(&config).await?;
    let hub = Hub::with_config(pubsub, config.hub_config());
    let authenticator = Arc::new(StaticTokenAuthenticator::new(config.auth.token_table()));
    let state = Arc::new(AppState::new(hub, config.clone(), authenticator));

    // Start metrics server if enabled
    if config.metrics.enabled {
        match metrics::start_metrics_server(&config.host, config.metrics.port) {
            Ok(()) => metrics::spawn_stats_sampler(state.hub.clone(), state.shutdown.clone()),
            Err(e) => error!("Failed to start metrics server: {:#}", e),
        }
    }

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Roomcast server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, config.websocket.path);

    serve(listener, state, shutdown_signal()).await
}

/// Serve on `listener` until `shutdown` resolves, then close the hub.
///
/// # Errors
///
/// Returns an error if the server fails while running.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(Arc::clone(&state));

    let stopping = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutting down");
            stopping.shutdown.cancel();
            stopping.hub.close();
        })
        .await
        .context("Server error")?;

    state.hub.close();
    info!("Server stopped");
    Ok(())
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let websocket = Router::new()
        .route(&state.config.websocket.path, get(ws_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.authenticator),
            require_principal,
        ));

    Router::new()
        .merge(websocket)
        .route("/health", get(health_handler))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();
    Json(serde_json::json!({
        "status": if state.hub.is_closed() { "closing" } else { "ok" },
        "version": env!("CARGO_PKG_VERSION"),
        "connections": stats.connection_count,
        "rooms": stats.room_count,
        "subscriptions": stats.subscription_count,
    }))
}

/// Query parameters of the WebSocket endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Client-chosen connection ID; generated when absent.
    pub client_id: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    Extension(principal): Extension<Principal>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let max_frame_size = state.config.websocket.max_frame_size;
    ws.max_frame_size(max_frame_size)
        .max_message_size(max_frame_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, principal, params))
}

/// Drive one WebSocket connection until it closes.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    principal: Principal,
    params: WsParams,
) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = ConnectionId::from_client(params.client_id.as_deref());
    let connection = Connection::new(
        connection_id.clone(),
        principal.id.clone(),
        state.config.connection_config(),
    );
    let (sink, stream) = websocket::split(socket, state.config.websocket.max_frame_size);

    if let Err(e) = state.hub.register(connection.clone()) {
        warn!(connection = %connection_id, principal = %principal.id, error = %e, "Rejecting WebSocket connection");
        // The hub already closed the connection; this only sends the close frame.
        connection
            .write_loop(MeteredSink::new(sink), state.shutdown.child_token())
            .await;
        return;
    }
    debug!(connection = %connection_id, principal = %principal.id, "WebSocket connected");

    let cancel = state.shutdown.child_token();
    let writer = tokio::spawn(
        connection
            .clone()
            .write_loop(MeteredSink::new(sink), cancel.clone()),
    );

    let dispatcher = MeteredDispatcher::new(state.hub.clone());
    connection
        .read_loop(MeteredStream::new(stream), &dispatcher, cancel)
        .await;

    if let Err(e) = writer.await {
        error!(connection = %connection_id, error = %e, "Write loop panicked");
    }
    debug!(connection = %connection_id, "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::{self, Message};

    async fn start_server() -> (Arc<AppState>, String, tokio::sync::oneshot::Sender<()>) {
        let mut config = Config::default();
        config.metrics.enabled = false;
        let tokens = HashMap::from([
            ("token-1".to_string(), "user-1".to_string()),
            ("token-2".to_string(), "user-2".to_string()),
        ]);
        let hub = Hub::with_config(Arc::new(MemoryPubSub::new()), config.hub_config());
        let state = Arc::new(AppState::new(
            hub,
            config,
            Arc::new(StaticTokenAuthenticator::new(tokens)),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(serve(listener, Arc::clone(&state), async move {
            let _ = stop_rx.await;
        }));

        (state, format!("ws://{}/ws", addr), stop_tx)
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[tokio::test]
    async fn test_unauthenticated_upgrade_rejected() {
        let (_state, url, _stop) = start_server().await;

        let err = tokio_tungstenite::connect_async(url.as_str()).await.unwrap_err();
        assert!(matches!(err, tungstenite::Error::Http(ref response) if response.status() == 401));

        let err = tokio_tungstenite::connect_async(format!("{}?token=wrong", url))
            .await
            .unwrap_err();
        assert!(matches!(err, tungstenite::Error::Http(ref response) if response.status() == 401));
    }

    #[tokio::test]
    async fn test_general_room_end_to_end() {
        let (state, url, stop) = start_server().await;

        let (mut c1, _) = tokio_tungstenite::connect_async(format!("{}?token=token-1&client_id=c1", url))
            .await
            .unwrap();
        let (mut c2, _) = tokio_tungstenite::connect_async(format!("{}?token=token-2&client_id=c2", url))
            .await
            .unwrap();

        for client in [&mut c1, &mut c2] {
            client
                .send(Message::Text(r#"{"action":"JOIN_ROOM","room_id":"general"}"#.into()))
                .await
                .unwrap();
        }
        eventually(|| state.hub.room_member_count("general") == 2).await;
        assert!(state.hub.has_subscription("general"));

        // Garbage and unknown actions leave the connection usable.
        c1.send(Message::Text("not json".into())).await.unwrap();
        c1.send(Message::Text(r#"{"action":"UNKNOWN"}"#.into()))
            .await
            .unwrap();
        c1.send(Message::Text(
            r#"{"action":"CHAT_MESSAGE","room_id":"general","data":{"text":"hello"}}"#.into(),
        ))
        .await
        .unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), c2.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = match message {
            Message::Text(text) => text,
            other => panic!("expected text frame, got {other:?}"),
        };
        let received: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(received["action"], "CHAT_MESSAGE");
        assert_eq!(received["room_id"], "general");
        assert_eq!(received["sender_id"], "user-1");
        assert_eq!(received["data"]["text"], "hello");

        c1.close(None).await.unwrap();
        c2.close(None).await.unwrap();
        eventually(|| state.hub.stats().connection_count == 0).await;
        assert!(!state.hub.room_exists("general"));
        assert!(!state.hub.has_subscription("general"));

        stop.send(()).unwrap();
        eventually(|| state.hub.is_closed()).await;
    }

    #[tokio::test]
    async fn test_client_id_of_other_principal_rejected() {
        let (state, url, _stop) = start_server().await;

        let (mut holder, _) = tokio_tungstenite::connect_async(format!("{}?token=token-1&client_id=tab-1", url))
            .await
            .unwrap();
        holder
            .send(Message::Text(r#"{"action":"JOIN_ROOM","room_id":"general"}"#.into()))
            .await
            .unwrap();
        eventually(|| state.hub.room_member_count("general") == 1).await;

        let (mut intruder, _) = tokio_tungstenite::connect_async(format!("{}?token=token-2&client_id=tab-1", url))
            .await
            .unwrap();
        let closed = tokio::time::timeout(Duration::from_secs(5), intruder.next())
            .await
            .unwrap();
        assert!(matches!(closed, None | Some(Ok(Message::Close(_))) | Some(Err(_))));

        assert_eq!(state.hub.stats().connection_count, 1);
        assert_eq!(state.hub.room_member_count("general"), 1);
        holder
            .send(Message::Text(
                r#"{"action":"CHAT_MESSAGE","room_id":"general","data":"still here"}"#.into(),
            ))
            .await
            .unwrap();
        let message = tokio::time::timeout(Duration::from_secs(5), holder.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(message, Message::Text(ref text) if text.as_str().contains("still here")));
    }

    #[tokio::test]
    async fn test_health_reports_stats() {
        let (state, _url, _stop) = start_server().await;
        let response = health_handler(State(Arc::clone(&state))).await.into_response();
        assert_eq!(response.status(), 200);
    }
}
