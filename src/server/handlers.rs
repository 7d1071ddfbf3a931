//! HTTP status handlers.

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use super::state::{ServerState, SessionSummary};
use crate::protocol::{ServerSupport, TrustAlgorithm};
use crate::transport::Binding;

/// Create the status router
pub fn status_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: crate::VERSION,
    })
}

/// Trust commitment advertised to clients
#[derive(Serialize)]
pub struct TrustInfo {
    pub algorithm: TrustAlgorithm,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// Status response
#[derive(Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub lri_version: &'static str,
    pub binding: Binding,
    pub uptime_secs: u64,
    pub active_sessions: usize,
    pub live_nonces: usize,
    pub support: ServerSupport,
    pub trust: TrustInfo,
}

/// Status endpoint
async fn status(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let sealer = state.context.sealer();

    Json(StatusResponse {
        status: "ok",
        version: crate::VERSION,
        lri_version: crate::LRI_VERSION,
        binding: state.config.binding,
        uptime_secs: state.uptime().as_secs(),
        active_sessions: state.sessions.count().await,
        live_nonces: state.context.replay().live_count(),
        support: state.context.support().clone(),
        trust: TrustInfo {
            algorithm: sealer.algorithm(),
            public_key: sealer.public_key_hex(),
        },
    })
}

/// List established sessions
async fn list_sessions(State(state): State<Arc<ServerState>>) -> Json<Vec<SessionSummary>> {
    Json(state.sessions.list().await)
}

/// Get session info
async fn get_session(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.sessions.get(&id).await {
        Some(summary) => (StatusCode::OK, Json(serde_json::json!(summary))),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Session not found"})),
        ),
    }
}
