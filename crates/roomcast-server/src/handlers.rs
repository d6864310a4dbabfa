//! Connection handlers for the Roomcast server.
//!
//! This module handles the HTTP routes, the WebSocket connection lifecycle,
//! and the translation between client frames and gateway calls.

use crate::auth::{self, Principal, PrincipalVerifier};
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use roomcast_broker::{Broker, BridgeStatus, PubSubBridge};
use roomcast_core::{ClientSession, ConnectionGateway, ConnectionId, InstanceIdentity};
use roomcast_protocol::{codec, ErrorCode, Frame, WireFormat, PROTOCOL_VERSION};
use serde::Deserialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The gateway for this instance.
    pub gateway: Arc<ConnectionGateway>,
    /// Server configuration.
    pub config: Config,
    /// Upgrade authentication.
    pub verifier: Arc<dyn PrincipalVerifier>,
    /// Connection slots bounded by `limits.max_connections`.
    pub slots: Arc<ConnectionSlots>,
}

/// Counts connections against a limit.
///
/// A slot is taken before the upgrade and held until the connection ends.
#[derive(Debug)]
pub struct ConnectionSlots {
    active: AtomicUsize,
    limit: usize,
}

impl ConnectionSlots {
    /// Create a pool of `limit` slots.
    #[must_use]
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            limit,
        })
    }

    /// Take a slot, or `None` when all are in use.
    #[must_use]
    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionSlot> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < self.limit).then_some(active + 1)
            })
            .ok()
            .map(|_| ConnectionSlot {
                slots: Arc::clone(self),
            })
    }

    /// Slots currently held.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// A held connection slot, released on drop.
#[derive(Debug)]
pub struct ConnectionSlot {
    slots: Arc<ConnectionSlots>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.slots.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl AppState {
    /// Build the gateway on `broker` and start it.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker stays unreachable through the
    /// configured startup attempts.
    pub async fn start(config: Config, broker: Arc<dyn Broker>) -> Result<Arc<Self>> {
        let identity = config
            .instance_id
            .clone()
            .map_or_else(InstanceIdentity::generate, InstanceIdentity::from_string);

        let bridge = Arc::new(PubSubBridge::new(broker, config.bridge_config()));
        let gateway = Arc::new(ConnectionGateway::new(
            bridge,
            identity,
            config.gateway_config(),
        ));
        gateway
            .start()
            .await
            .context("Failed to start gateway")?;

        Ok(Arc::new(Self {
            verifier: auth::verifier_for(&config.auth),
            slots: ConnectionSlots::new(config.limits.max_connections),
            gateway,
            config,
        }))
    }
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve until `shutdown` resolves, then shut the gateway down.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(Arc::clone(&state));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    state.gateway.shutdown().await;
    Ok(())
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the broker or the listener cannot be set up.
pub async fn run_server(config: Config) -> Result<()> {
    let broker = roomcast_broker::open(&config.broker.url)
        .with_context(|| format!("Invalid broker URL: {}", config.broker.url))?;
    let addr = config.bind_addr()?;
    let state = AppState::start(config.clone(), broker).await?;

    // Start metrics server if enabled
    let sampler = if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        Some(metrics::spawn_sampler(
            Arc::clone(&state.gateway),
            metrics::SAMPLE_INTERVAL,
        ))
    } else {
        None
    };

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(
        instance = %state.gateway.identity(),
        broker = state.gateway.bridge().broker_name(),
        "Roomcast server listening on {}",
        addr
    );
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    let result = serve(listener, state, shutdown_signal()).await;
    if let Some(sampler) = sampler {
        sampler.abort();
    }
    result
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let bridge = state.gateway.bridge();
    let broker_status = bridge.status();
    let registry = state.gateway.registry().stats();

    axum::Json(serde_json::json!({
        "status": if broker_status == BridgeStatus::Connected { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "instance": state.gateway.identity().as_str(),
        "broker": {
            "kind": bridge.broker_name(),
            "status": broker_status.as_str(),
        },
        "connections": registry.connections,
        "rooms": registry.rooms,
    }))
}

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Default, Deserialize)]
struct ConnectParams {
    token: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let token = auth::bearer_token(&headers).or(params.token);
    let principal = match state.verifier.verify(token.as_deref()).await {
        Ok(principal) => principal,
        Err(e) => {
            warn!(error = %e, "Upgrade rejected");
            metrics::record_error("auth");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };

    let Some(slot) = state.slots.try_acquire() else {
        warn!("Connection limit reached");
        metrics::record_error("connection_limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response();
    };

    // A failed upgrade drops the callback and with it the slot.
    ws.on_upgrade(move |socket| handle_websocket(socket, state, principal, slot))
}

/// One client connection.
struct Connection {
    id: ConnectionId,
    state: Arc<AppState>,
    sender: SplitSink<WebSocket, Message>,
    /// Replies and deliveries use the encoding the client last used.
    format: WireFormat,
    read_buffer: BytesMut,
}

impl Connection {
    /// Send a frame. Returns `false` once the socket is gone.
    async fn send(&mut self, frame: &Frame) -> bool {
        match send_frame(&mut self.sender, frame, self.format).await {
            Ok(()) => true,
            Err(e) => {
                debug!(connection = %self.id, error = %e, "Send failed");
                false
            }
        }
    }

    /// Handle one WebSocket message. Returns `false` to close.
    async fn on_message(&mut self, msg: Message) -> bool {
        match msg {
            Message::Text(text) => {
                self.format = WireFormat::Text;
                match codec::decode_text(&text) {
                    Ok(frame) => self.on_frame(frame).await,
                    Err(e) => self.malformed(&e.to_string()).await,
                }
            }
            Message::Binary(data) => {
                self.format = WireFormat::Binary;
                self.read_buffer.extend_from_slice(&data);
                loop {
                    let keep_open = match codec::decode_from(&mut self.read_buffer) {
                        Ok(Some(frame)) => self.on_frame(frame).await,
                        Ok(None) => return true,
                        Err(e) => self.malformed(&e.to_string()).await,
                    };
                    if !keep_open {
                        return false;
                    }
                }
            }
            Message::Ping(data) => self.sender.send(Message::Pong(data)).await.is_ok(),
            Message::Pong(_) => true,
            Message::Close(_) => {
                debug!(connection = %self.id, "Received close frame");
                false
            }
        }
    }

    async fn malformed(&mut self, reason: &str) -> bool {
        debug!(connection = %self.id, reason = %reason, "Malformed frame");
        metrics::record_error("malformed_frame");
        self.send(&Frame::error(0, ErrorCode::MalformedFrame, reason))
            .await
    }

    async fn on_frame(&mut self, frame: Frame) -> bool {
        let start = Instant::now();
        metrics::record_inbound();

        let reply = handle_frame(frame, self.id, &self.state).await;
        metrics::record_latency(start.elapsed().as_secs_f64());

        match reply {
            Some(reply) => self.send(&reply).await,
            None => true,
        }
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    principal: Principal,
    _slot: ConnectionSlot,
) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let ClientSession { id, mut deliveries } = state.gateway.connect();
    debug!(connection = %id, principal = %principal, "WebSocket connected");

    let (sender, mut receiver) = socket.split();
    let mut connection = Connection {
        id,
        state: Arc::clone(&state),
        sender,
        format: WireFormat::default(),
        read_buffer: BytesMut::with_capacity(4096),
    };

    let connected = Frame::connected(
        id.to_string(),
        state.gateway.identity().as_str(),
        PROTOCOL_VERSION.major,
        u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX),
    );

    if connection.send(&connected).await {
        loop {
            tokio::select! {
                biased;

                // Deliveries from local broadcast and fanout
                Some(delivery) = deliveries.recv() => {
                    let frame = Frame::delivery(&*delivery.room, &*delivery.message);
                    if !connection.send(&frame).await {
                        break;
                    }
                }

                msg = receiver.next() => match msg {
                    Some(Ok(msg)) => {
                        if !connection.on_message(msg).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(connection = %id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %id, "WebSocket stream ended");
                        break;
                    }
                },
            }
        }
    } else {
        error!(connection = %id, "Failed to send Connected frame");
    }

    state.gateway.disconnect(id);
    debug!(connection = %id, "WebSocket disconnected");
}

/// Handle a decoded frame, returning the reply if there is one.
async fn handle_frame(frame: Frame, id: ConnectionId, state: &AppState) -> Option<Frame> {
    let request_id = frame.request_id();

    let result = match frame {
        Frame::JoinRoom { room, .. } => state.gateway.join(id, &room).map(|joined| {
            debug!(connection = %id, room = %room, joined, "Join request");
        }),

        Frame::LeaveRoom { room, .. } => state.gateway.leave(id, &room).map(|left| {
            debug!(connection = %id, room = %room, left, "Leave request");
        }),

        Frame::Message { room, message, .. } => {
            state.gateway.send(id, &room, &message).await.map(|report| {
                debug!(
                    connection = %id,
                    room = %room,
                    local = report.local_recipients,
                    published = report.publish.is_published(),
                    "Message"
                );
            })
        }

        Frame::Ping { timestamp } => return Some(Frame::pong(timestamp)),

        Frame::Pong { .. } => return None,

        other => {
            warn!(connection = %id, frame_type = %other.frame_type(), "Unexpected frame type");
            return Some(Frame::error(
                0,
                ErrorCode::MalformedFrame,
                format!("Unexpected frame type: {}", other.frame_type()),
            ));
        }
    };

    match result {
        Ok(()) => request_id.map(Frame::ack),
        Err(e) => {
            let code = e.error_code().unwrap_or(ErrorCode::UnknownConnection);
            debug!(connection = %id, error = %e, "Request rejected");
            Some(Frame::error(request_id.unwrap_or(0), code, e.to_string()))
        }
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &Frame,
    format: WireFormat,
) -> Result<()> {
    let message = match format {
        WireFormat::Text => Message::Text(codec::encode_text(frame)?),
        WireFormat::Binary => Message::Binary(codec::encode(frame)?.to_vec()),
    };
    sender.send(message).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomcast_broker::MemoryBroker;

    async fn state() -> Arc<AppState> {
        let config = Config {
            instance_id: Some("1111-1111".to_string()),
            ..Config::default()
        };
        AppState::start(config, Arc::new(MemoryBroker::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_join_and_message_replies() {
        let state = state().await;
        let ClientSession { id, .. } = state.gateway.connect();

        let reply = handle_frame(
            Frame::JoinRoom {
                id: Some(1),
                room: "lobby".to_string(),
            },
            id,
            &state,
        )
        .await;
        assert_eq!(reply, Some(Frame::ack(1)));

        // No request id, no ack.
        let reply = handle_frame(Frame::message("lobby", "hi"), id, &state).await;
        assert_eq!(reply, None);

        let reply = handle_frame(Frame::message_with_ack(2, "lobby", "hi"), id, &state).await;
        assert_eq!(reply, Some(Frame::ack(2)));
    }

    #[tokio::test]
    async fn test_error_replies() {
        let state = state().await;
        let ClientSession { id, .. } = state.gateway.connect();

        let reply = handle_frame(Frame::message_with_ack(3, "lobby", "hi"), id, &state).await;
        assert!(matches!(
            reply,
            Some(Frame::Error { id: 3, code: 1003, .. })
        ));

        let reply = handle_frame(Frame::join("$system"), id, &state).await;
        assert!(matches!(
            reply,
            Some(Frame::Error { id: 0, code: 1002, .. })
        ));

        let reply = handle_frame(Frame::ack(9), id, &state).await;
        assert!(matches!(
            reply,
            Some(Frame::Error { code: 1001, .. })
        ));
    }

    #[tokio::test]
    async fn test_ping() {
        let state = state().await;
        let ClientSession { id, .. } = state.gateway.connect();

        let reply = handle_frame(Frame::Ping { timestamp: Some(7) }, id, &state).await;
        assert_eq!(reply, Some(Frame::pong(Some(7))));
    }

    #[test]
    fn test_connection_slots() {
        let slots = ConnectionSlots::new(2);
        let first = slots.try_acquire().unwrap();
        let _second = slots.try_acquire().unwrap();
        assert!(slots.try_acquire().is_none());
        assert_eq!(slots.active(), 2);

        drop(first);
        assert_eq!(slots.active(), 1);
        assert!(slots.try_acquire().is_some());
    }

    #[test]
    fn test_concurrent_acquire_respects_limit() {
        let slots = ConnectionSlots::new(8);
        let barrier = Arc::new(std::sync::Barrier::new(32));

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let slots = Arc::clone(&slots);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    slots.try_acquire()
                })
            })
            .collect();
        let held: Vec<_> = handles
            .into_iter()
            .filter_map(|handle| handle.join().unwrap())
            .collect();

        assert_eq!(held.len(), 8);
        assert_eq!(slots.active(), 8);
        drop(held);
        assert_eq!(slots.active(), 0);
    }
}
