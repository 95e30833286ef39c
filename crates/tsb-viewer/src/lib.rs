//! Realtime viewer channel (axum WebSocket server).
//!
//! `GET /ws` upgrades to a viewer session fed by the core
//! [`Broadcaster`]; `GET /health` returns the latest health snapshot.

use std::sync::Arc;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tsb_core::{broadcast::Broadcaster, Result};

pub mod session;

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct ViewerState {
    pub broadcaster: Arc<Broadcaster>,
}

impl ViewerState {
    pub fn new(broadcaster: Arc<Broadcaster>) -> Self {
        Self { broadcaster }
    }
}

pub fn router(state: ViewerState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve viewers on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    state: ViewerState,
    cancel: CancellationToken,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "viewer channel listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("viewer channel stopped");
    Ok(())
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ViewerState>) -> Response {
    ws.on_upgrade(move |socket| session::run_viewer_session(socket, state.broadcaster))
}

/// GET /health: 200 when every dependency is ONLINE, 503 otherwise or before
/// the first probe.
async fn health_handler(State(state): State<ViewerState>) -> Response {
    match state.broadcaster.latest_health() {
        Some(status) => {
            let code = if status.all_online() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            (code, Json(status)).into_response()
        }
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "starting" })),
        )
            .into_response(),
    }
}
