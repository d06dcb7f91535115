//! Connection handlers for the Duet server.
//!
//! This module handles the connection lifecycle and the read-only HTTP API.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::BytesMut;
use duet_core::{ConnectionId, CoreError, EventGateway, MemoryStore, MessageStore};
use duet_protocol::{codec, ClientEvent, Encoding, ProtocolError, ServerEvent};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Counts open WebSocket connections against a fixed limit.
#[derive(Debug)]
pub struct ConnectionLimiter {
    open: AtomicUsize,
    max: usize,
}

impl ConnectionLimiter {
    /// Create a limiter admitting at most `max` connections.
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            open: AtomicUsize::new(0),
            max,
        }
    }

    /// Reserve a slot, or `None` if the limit is reached.
    ///
    /// The slot is released when the returned guard is dropped.
    #[must_use]
    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionSlot> {
        self.open
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |open| {
                (open < self.max).then_some(open + 1)
            })
            .ok()
            .map(|_| ConnectionSlot {
                limiter: Arc::clone(self),
            })
    }

    /// Number of reserved slots.
    #[must_use]
    pub fn open(&self) -> usize {
        self.open.load(Ordering::Acquire)
    }
}

/// A reserved connection slot.
#[derive(Debug)]
pub struct ConnectionSlot {
    limiter: Arc<ConnectionLimiter>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.limiter.open.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Shared server state.
pub struct AppState {
    /// The event gateway.
    pub gateway: Arc<EventGateway>,
    /// Connection slots.
    pub limiter: Arc<ConnectionLimiter>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state over `store`.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn MessageStore>) -> Self {
        Self {
            gateway: Arc::new(EventGateway::with_config(store, config.gateway())),
            limiter: Arc::new(ConnectionLimiter::new(config.limits.max_connections)),
            config,
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route(
            "/api/conversations/:user_id/:peer_id/messages",
            get(history_handler),
        )
        .route("/api/last-messages/:user_id", get(last_messages_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Duet server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, config, Arc::new(MemoryStore::new())).await
}

/// Serve on an already bound listener.
///
/// # Errors
///
/// Returns an error if serving fails.
pub async fn serve(
    listener: TcpListener,
    config: Config,
    store: Arc<dyn MessageStore>,
) -> Result<()> {
    let state = Arc::new(AppState::new(config, store));
    let _fanout = state.gateway.spawn_presence_fanout();

    axum::serve(listener, app(state)).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.gateway.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "online": stats.online_count,
        "connections": stats.connection_count,
    }))
}

/// Error body for the HTTP API.
struct ApiError(CoreError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = if self.0.is_client_error() {
            (StatusCode::BAD_REQUEST, self.0.to_string())
        } else {
            error!(error = %self.0, "API request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            )
        };
        (status, Json(serde_json::json!({ "message": message }))).into_response()
    }
}

/// Conversation history handler.
async fn history_handler(
    State(state): State<Arc<AppState>>,
    Path((user_id, peer_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state
        .gateway
        .delivery()
        .history(&user_id, &peer_id)
        .await
        .map_err(ApiError)?;
    Ok(Json(messages))
}

/// Latest message per conversation handler.
async fn last_messages_handler(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let summaries = state
        .gateway
        .delivery()
        .last_messages(&user_id)
        .await
        .map_err(ApiError)?;
    Ok(Json(summaries))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let gateway = Arc::clone(&state.gateway);
    let max_frame_size = state.config.limits.max_frame_size;

    let (mut sender, mut receiver) = socket.split();

    let Some(_slot) = state.limiter.try_acquire() else {
        warn!("Connection limit reached, refusing connection");
        metrics::record_error("connection_limit");
        let notice = ServerEvent::error("Server is at capacity, try again later.");
        if let Ok(message) = encode_event(&notice, Encoding::Json) {
            let _ = sender.send(message).await;
        }
        let _ = sender.send(Message::Close(None)).await;
        return;
    };

    let (connection_id, mut outbox) = gateway.open();
    debug!(connection = %connection_id, "WebSocket connected");

    // Inbound events run on their own task, in arrival order, so a slow
    // store never stalls the outbox drain below.
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ClientEvent>();
    let worker = tokio::spawn(process_inbound(
        Arc::clone(&gateway),
        connection_id.clone(),
        inbound_rx,
    ));

    // Replies use whichever encoding the client last sent.
    let mut encoding = Encoding::Json;

    // Read buffer for partial binary frames
    let mut read_buffer = BytesMut::with_capacity(4096);

    loop {
        tokio::select! {
            biased;

            Some(event) = outbox.recv() => {
                if send_event(&mut sender, &event, encoding, &connection_id).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        encoding = Encoding::Json;
                        metrics::record_frame(text.len(), "inbound");

                        if text.len() > max_frame_size {
                            reject_oversized(&gateway, &connection_id, text.len(), max_frame_size);
                            continue;
                        }

                        match codec::decode_json::<ClientEvent>(&text) {
                            Ok(event) => forward(&inbound_tx, event),
                            Err(e) => reject(&gateway, &connection_id, e),
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        encoding = Encoding::MessagePack;
                        metrics::record_frame(data.len(), "inbound");

                        if read_buffer.len() + data.len() > max_frame_size {
                            read_buffer.clear();
                            reject_oversized(&gateway, &connection_id, data.len(), max_frame_size);
                            continue;
                        }
                        read_buffer.extend_from_slice(&data);

                        loop {
                            match codec::decode_from::<ClientEvent>(&mut read_buffer) {
                                Ok(Some(event)) => forward(&inbound_tx, event),
                                Ok(None) => break,
                                Err(e @ ProtocolError::FrameTooLarge(_)) => {
                                    // The length prefix cannot be trusted; drop what is buffered.
                                    read_buffer.clear();
                                    reject(&gateway, &connection_id, e);
                                    break;
                                }
                                Err(e) => reject(&gateway, &connection_id, e),
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Ignore pongs
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    // Let queued events finish before releasing presence, so a late
    // user:online cannot bind a closed connection.
    drop(inbound_tx);
    if let Err(e) = worker.await {
        error!(connection = %connection_id, error = %e, "Inbound worker failed");
    }

    gateway.close(&connection_id);
    metrics::set_users_online(gateway.stats().online_count);

    debug!(connection = %connection_id, "WebSocket disconnected");
}

/// Hand inbound events to the gateway one at a time.
async fn process_inbound(
    gateway: Arc<EventGateway>,
    connection_id: ConnectionId,
    mut inbound: mpsc::UnboundedReceiver<ClientEvent>,
) {
    while let Some(event) = inbound.recv().await {
        let start = Instant::now();
        let name = event.name();
        let tracks_presence = matches!(event, ClientEvent::UserOnline(_));

        gateway.handle(&connection_id, event).await;

        metrics::record_dispatch(start.elapsed().as_secs_f64());
        debug!(connection = %connection_id, event = name, "Event handled");
        if tracks_presence {
            metrics::set_users_online(gateway.stats().online_count);
        }
    }
}

fn forward(inbound: &mpsc::UnboundedSender<ClientEvent>, event: ClientEvent) {
    metrics::record_event(event.name(), "inbound");
    // The worker only stops after this sender is dropped.
    let _ = inbound.send(event);
}

fn reject(gateway: &EventGateway, connection_id: &ConnectionId, err: ProtocolError) {
    metrics::record_error("decode");
    gateway.reject(connection_id, err);
}

fn reject_oversized(gateway: &EventGateway, connection_id: &ConnectionId, size: usize, max: usize) {
    metrics::record_error("frame_too_large");
    gateway.reject(
        connection_id,
        format!("frame of {} bytes exceeds limit of {}", size, max),
    );
}

/// Encode an outbound event for the wire.
fn encode_event(event: &ServerEvent, encoding: Encoding) -> Result<Message, ProtocolError> {
    match encoding {
        Encoding::Json => Ok(Message::Text(codec::encode_json(event)?)),
        Encoding::MessagePack => Ok(Message::Binary(codec::encode(event)?.to_vec())),
    }
}

/// Send an event to the WebSocket.
///
/// An event that cannot be encoded is logged and skipped; only a failed
/// socket write is returned as an error.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
    encoding: Encoding,
    connection_id: &ConnectionId,
) -> Result<()> {
    let message = match encode_event(event, encoding) {
        Ok(message) => message,
        Err(e) => {
            error!(connection = %connection_id, event = event.name(), error = %e, "Failed to encode event");
            metrics::record_error("encode");
            return Ok(());
        }
    };

    let size = match &message {
        Message::Text(text) => text.len(),
        Message::Binary(data) => data.len(),
        _ => 0,
    };
    metrics::record_frame(size, "outbound");
    metrics::record_event(event.name(), "outbound");

    sender.send(message).await?;
    Ok(())
}
