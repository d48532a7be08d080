//! WebSocket gateway server.
//!
//! Serves the request/response/event protocol over `/ws`. Each connection
//! optionally authenticates with a `connect` handshake, dispatches request
//! frames through the method registry, and receives event frames for the
//! sessions it subscribed to.

use crate::error::GatewayError;
use crate::frame::Frame;
use crate::handlers::{self, GatewayContext};
use crate::methods::MethodRegistry;
use crate::pipeline::MessagePipeline;
use crate::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use chatmux_core::config::{BindMode, GatewayConfig};
use chatmux_core::types::{ConversationKey, SessionId};
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Gateway server state shared across connections.
struct ServerState {
    methods: Arc<MethodRegistry>,
    pipeline: Arc<MessagePipeline>,
    config: GatewayConfig,
    clients: RwLock<HashMap<String, ClientInfo>>,
}

/// Information about a connected client.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Client ID.
    pub id: String,

    /// Connection time.
    pub connected_at: chrono::DateTime<chrono::Utc>,

    /// Remote address.
    pub remote_addr: SocketAddr,
}

/// The WebSocket gateway server.
pub struct GatewayServer {
    state: Arc<ServerState>,
}

impl GatewayServer {
    /// Create a server with all built-in methods registered.
    pub async fn new(context: Arc<GatewayContext>) -> Self {
        let methods = Arc::new(MethodRegistry::new());
        handlers::register_all(&methods, context.clone()).await;

        let state = Arc::new(ServerState {
            methods,
            pipeline: context.pipeline.clone(),
            config: context.config.gateway.clone(),
            clients: RwLock::new(HashMap::new()),
        });

        Self { state }
    }

    /// The method registry, for registering additional handlers.
    pub fn methods(&self) -> &Arc<MethodRegistry> {
        &self.state.methods
    }

    /// The address the server will bind.
    pub fn bind_address(&self) -> SocketAddr {
        bind_address(&self.state.config)
    }

    /// Bind the listener without serving yet.
    ///
    /// Split from [`GatewayServer::serve`] so callers (and tests) can learn
    /// the bound port before traffic starts.
    pub async fn listen(&self) -> Result<tokio::net::TcpListener> {
        let addr = self.bind_address();
        if self.state.config.bind != BindMode::Loopback && self.state.config.auth_token.is_none() {
            warn!("gateway is reachable from the network without an auth token");
        }
        Ok(tokio::net::TcpListener::bind(addr).await?)
    }

    /// Serve connections on an already-bound listener.
    pub async fn serve(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!("gateway listening on {}", addr);

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
        Ok(())
    }

    /// Bind and serve.
    pub async fn run(&self) -> Result<()> {
        let listener = self.listen().await?;
        self.serve(listener).await
    }

    fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(self.state.clone());

        if self.state.config.cors {
            router = router.layer(CorsLayer::permissive());
        }

        router
    }

    /// Number of connected clients.
    pub async fn client_count(&self) -> usize {
        self.state.clients.read().await.len()
    }
}

fn bind_address(config: &GatewayConfig) -> SocketAddr {
    SocketAddr::from((config.bind.ip(), config.port))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> std::result::Result<impl IntoResponse, axum::http::StatusCode> {
    let client_count = state.clients.read().await.len();
    if client_count >= state.config.max_connections {
        warn!(
            "max connections ({}) reached, rejecting {}",
            state.config.max_connections, addr
        );
        return Err(axum::http::StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, addr)))
}

/// Per-connection state the request loop threads through.
struct Connection {
    out_tx: mpsc::UnboundedSender<String>,
    subscriptions: Arc<RwLock<HashSet<SessionId>>>,
    authenticated: Arc<AtomicBool>,
}

impl Connection {
    fn send(&self, frame: &Frame) {
        if let Ok(text) = serde_json::to_string(frame) {
            let _ = self.out_tx.send(text);
        }
    }
}

/// Handle one WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<ServerState>, remote_addr: SocketAddr) {
    let client_id = uuid::Uuid::new_v4().to_string();
    {
        let mut clients = state.clients.write().await;
        clients.insert(
            client_id.clone(),
            ClientInfo {
                id: client_id.clone(),
                connected_at: chrono::Utc::now(),
                remote_addr,
            },
        );
    }
    info!("client connected: {} from {}", client_id, remote_addr);

    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    // Single writer task: responses and events funnel through one channel,
    // preserving per-session event order.
    let writer_task = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let connection = Connection {
        out_tx: out_tx.clone(),
        subscriptions: Arc::new(RwLock::new(HashSet::new())),
        // without a configured token every connection is trusted
        authenticated: Arc::new(AtomicBool::new(state.config.auth_token.is_none())),
    };

    // Forward pipeline events for subscribed sessions.
    let mut events = state.pipeline.subscribe();
    let event_task = {
        let out_tx = out_tx.clone();
        let subscriptions = connection.subscriptions.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if !subscriptions.read().await.contains(&event.session_id) {
                            continue;
                        }
                        let payload = match serde_json::to_value(&event) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        let frame = Frame::event("chat.event", payload);
                        let Ok(text) = serde_json::to_string(&frame) else {
                            continue;
                        };
                        if out_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("event subscriber lagged, dropped {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_frame(&text, &state, &connection).await;
            }
            Ok(Message::Close(_)) => {
                debug!("client {} closed connection", client_id);
                break;
            }
            Err(e) => {
                warn!("websocket error from {}: {}", client_id, e);
                break;
            }
            _ => {}
        }
    }

    event_task.abort();
    drop(out_tx);
    drop(connection);
    let _ = writer_task.await;

    state.clients.write().await.remove(&client_id);
    info!("client disconnected: {}", client_id);
}

/// Handle one inbound frame.
async fn handle_frame(text: &str, state: &Arc<ServerState>, connection: &Connection) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            connection.send(&Frame::err(
                "",
                &GatewayError::InvalidParams(format!("unparseable frame: {}", e)),
            ));
            return;
        }
    };
    let Frame::Req { id, method, params } = frame else {
        // clients only send request frames
        return;
    };

    if method == "connect" {
        handle_connect(&id, params, state, connection);
        return;
    }
    if !connection.authenticated.load(Ordering::SeqCst) {
        connection.send(&Frame::err(
            id,
            &GatewayError::Unauthorized("connect with a valid token first".to_string()),
        ));
        return;
    }

    // subscription management is connection-scoped, not a registry method
    match method.as_str() {
        "chat.subscribe" => {
            let frame = match session_id_param(&params) {
                Some(session_id) => {
                    connection.subscriptions.write().await.insert(session_id);
                    Frame::ok(id, serde_json::json!({ "subscribed": true }))
                }
                None => Frame::err(
                    id,
                    &GatewayError::InvalidParams("sessionId required".to_string()),
                ),
            };
            connection.send(&frame);
            return;
        }
        "chat.unsubscribe" => {
            let frame = match session_id_param(&params) {
                Some(session_id) => {
                    connection.subscriptions.write().await.remove(&session_id);
                    Frame::ok(id, serde_json::json!({ "subscribed": false }))
                }
                None => Frame::err(
                    id,
                    &GatewayError::InvalidParams("sessionId required".to_string()),
                ),
            };
            connection.send(&frame);
            return;
        }
        _ => {}
    }

    // chat.send implicitly subscribes the caller before the turn starts,
    // so it sees its own streamed events
    if method == "chat.send" {
        if let Some(key) = conversation_key_param(&params) {
            if let Ok(session) = state.pipeline.registry().resolve(&key).await {
                connection.subscriptions.write().await.insert(session.id);
            }
        }
    }

    // Dispatch off the request loop: a streaming turn must not block
    // further frames (chat.abort in particular) on this connection.
    let state = state.clone();
    let out_tx = connection.out_tx.clone();
    tokio::spawn(async move {
        let frame = match state.methods.call(&method, params).await {
            Ok(value) => Frame::ok(id, value),
            Err(e) => Frame::err(id, &e),
        };
        if let Ok(text) = serde_json::to_string(&frame) {
            let _ = out_tx.send(text);
        }
    });
}

fn handle_connect(
    id: &str,
    params: Option<serde_json::Value>,
    state: &Arc<ServerState>,
    connection: &Connection,
) {
    match &state.config.auth_token {
        Some(expected) => {
            let supplied = params
                .as_ref()
                .and_then(|p| p.get("token"))
                .and_then(|t| t.as_str());
            if supplied == Some(expected.as_str()) {
                connection.authenticated.store(true, Ordering::SeqCst);
            } else {
                connection.send(&Frame::err(
                    id,
                    &GatewayError::Unauthorized("invalid token".to_string()),
                ));
                return;
            }
        }
        None => {}
    }
    connection.send(&Frame::ok(
        id,
        serde_json::json!({
            "server": "chatmux",
            "version": env!("CARGO_PKG_VERSION"),
        }),
    ));
}

fn session_id_param(params: &Option<serde_json::Value>) -> Option<SessionId> {
    params
        .as_ref()
        .and_then(|p| p.get("sessionId"))
        .and_then(|v| v.as_str())
        .map(SessionId::new)
}

fn conversation_key_param(params: &Option<serde_json::Value>) -> Option<ConversationKey> {
    let params = params.as_ref()?;
    Some(ConversationKey::new(
        params.get("channel")?.as_str()?,
        params.get("conversationId")?.as_str()?,
    ))
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let clients = state.clients.read().await.len();
    serde_json::json!({
        "status": "ok",
        "clients": clients,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_address_modes() {
        let config = GatewayConfig::default();
        assert_eq!(bind_address(&config).ip().to_string(), "127.0.0.1");

        let config = GatewayConfig {
            bind: BindMode::Lan,
            port: 9000,
            ..GatewayConfig::default()
        };
        let addr = bind_address(&config);
        assert_eq!(addr.ip().to_string(), "0.0.0.0");
        assert_eq!(addr.port(), 9000);
    }

    #[test]
    fn test_session_id_param() {
        assert_eq!(
            session_id_param(&Some(serde_json::json!({"sessionId": "s1"}))),
            Some(SessionId::new("s1"))
        );
        assert_eq!(session_id_param(&None), None);
    }

    #[test]
    fn test_conversation_key_param() {
        let key = conversation_key_param(&Some(serde_json::json!({
            "channel": "web",
            "conversationId": "42",
            "text": "hi",
        })))
        .unwrap();
        assert_eq!(key.channel, "web");
        assert_eq!(key.conversation_id, "42");
    }
}
