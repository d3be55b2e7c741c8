//! Axum routes: the index page, `/health`, and the `/ws` upgrade.
//!
//! CORS applies to the plain HTTP routes only; the WebSocket route is
//! mounted outside the CORS layer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Uri, header};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::get;
use sockloop_core::SessionId;
use sockloop_runtime::{LoopHandle, RemoteContext};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::health::{self, HealthResponse};
use crate::router::{CommandRouter, RouterContext};
use crate::websocket::run_ws_session;

/// Page served at `/` when no index file is configured.
pub const DEFAULT_INDEX: &str = include_str!("../assets/index.html");

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Command routing table.
    pub router: Arc<CommandRouter>,
    /// Handler context.
    pub ctx: Arc<RouterContext>,
    /// Handle used to spawn session tasks on the loop.
    pub loop_handle: LoopHandle,
    /// When the server started.
    pub started_at: Instant,
    /// Index page body.
    pub index: Arc<str>,
    /// Largest inbound WebSocket message accepted.
    pub max_message_size: usize,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::very_permissive());

    Router::new()
        .route("/ws", get(ws_handler))
        .merge(public)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /
async fn index_handler(State(state): State<AppState>) -> Html<String> {
    Html(state.index.to_string())
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.started_at, &state.ctx.server))
}

/// GET /ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
    State(state): State<AppState>,
) -> Response {
    let remote = remote_context(addr, &headers, &uri);
    let session = SessionId::new();
    let max_message_size = state.max_message_size;

    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| async move {
            let id = session.clone();
            let task = run_ws_session(socket, session, remote, state.router, state.ctx);
            if !state.loop_handle.spawn("ws-session", task) {
                warn!(session_id = %id, "event loop closed, dropping session");
            }
        })
        .into_response()
}

/// Snapshot of connection-establishment metadata.
pub fn remote_context(addr: SocketAddr, headers: &HeaderMap, uri: &Uri) -> RemoteContext {
    let mut context = RemoteContext::new();
    let _ = context.insert("remote_addr".into(), addr.to_string());
    let _ = context.insert("path".into(), uri.path().to_owned());
    if let Some(query) = uri.query() {
        let _ = context.insert("query".into(), query.to_owned());
    }
    for (key, name) in [
        ("user_agent", header::USER_AGENT),
        ("origin", header::ORIGIN),
        ("host", header::HOST),
    ] {
        if let Some(value) = headers.get(&name).and_then(|v| v.to_str().ok()) {
            let _ = context.insert(key.into(), value.to_owned());
        }
    }
    context
}
