//! HTTP server implementation using Axum.

use crate::ws::WsCodec;
use axum::{
    extract::{ws::WebSocket, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};
use vipnode_jsonrpc::{Dispatcher, Session, SessionConfig};
use vipnode_pool::VipnodePool;

/// Application state shared across handlers.
pub struct AppState {
    /// Pool operations, registered under `vipnode_`
    pub dispatcher: Arc<Dispatcher>,
    /// Limits applied to every session
    pub session_config: SessionConfig,
}

/// Health check endpoint.
async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn handle_ws(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

/// Run one pool session until the peer goes away.
async fn serve_socket(socket: WebSocket, state: Arc<AppState>) {
    let session = Session::start(
        WsCodec::new(socket),
        Arc::clone(&state.dispatcher),
        state.session_config,
    );
    info!("Session opened");
    session.closed().await;
    info!("Session closed");
}

/// Build the router serving `pool`.
pub fn router(pool: Arc<VipnodePool>, session_config: SessionConfig) -> anyhow::Result<Router> {
    let mut dispatcher = Dispatcher::new();
    pool.register(&mut dispatcher)?;
    let state = Arc::new(AppState {
        dispatcher: Arc::new(dispatcher),
        session_config,
    });

    // Browser-based agents connect from arbitrary origins
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Ok(Router::new()
        .route("/health", get(handle_health))
        .route("/", get(handle_ws))
        .layer(cors)
        .with_state(state))
}

/// Start the pool server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(pool: Arc<VipnodePool>, host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let app = router(pool, SessionConfig::default())?;

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server listening on {}", actual_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Server error: {}", e);
        }
    });

    Ok(actual_addr)
}
