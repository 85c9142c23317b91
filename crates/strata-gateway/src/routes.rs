use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::info;

use strata_agent::StartRequest;
use strata_core::error::StrataError;
use strata_core::types::{DegradationLevel, ExecutionId, SessionId};

use crate::socket;
use crate::state::AppState;

/// Service errors mapped onto HTTP statuses.
pub struct ApiError(StrataError);

impl From<StrataError> for ApiError {
    fn from(e: StrataError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StrataError::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
            StrataError::ExecutionRejected(_) => StatusCode::CONFLICT,
            StrataError::GraphValidation(_) | StrataError::Json(_) => StatusCode::BAD_REQUEST,
            StrataError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let report = state.service.health().await;
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "degradation": {
            "level": report.level,
            "pinned": report.pinned,
        },
        "breakers": report.breakers,
        "active_executions": report.active_executions,
        "pending_checkpoints": report.pending_checkpoints,
        "connections": state.connections.connection_count(),
        "sessions": state.connections.session_count(),
        "batches_flushed": state.batcher.flush_count(),
    }))
}

// POST /api/executions
pub async fn start_execution(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartRequest>,
) -> ApiResult<impl IntoResponse> {
    let started = state.service.start(body).await?;
    Ok((StatusCode::ACCEPTED, Json(started)))
}

// GET /api/executions/{id}
pub async fn execution_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let report = state.service.status(&ExecutionId::from_string(&id)).await?;
    Ok(Json(report))
}

// POST /api/executions/{id}/cancel
pub async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = ExecutionId::from_string(&id);
    state.service.cancel(&id).await?;
    Ok(Json(serde_json::json!({ "execution_id": id, "cancelled": true })))
}

#[derive(Deserialize)]
pub struct CheckpointQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

// GET /api/executions/{id}/checkpoints?limit=
pub async fn execution_checkpoints(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<CheckpointQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = ExecutionId::from_string(&id);
    let checkpoints = state.service.history(&id, q.limit).await?;
    Ok(Json(serde_json::json!({
        "execution_id": id,
        "checkpoints": checkpoints,
    })))
}

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

// GET /api/sessions/{id}/executions?limit=50
pub async fn session_executions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let session = SessionId::from_string(&id);
    let executions = state.service.list(&session, q.limit).await?;
    Ok(Json(serde_json::json!({ "executions": executions })))
}

#[derive(Deserialize)]
pub struct OverrideBody {
    /// `null` clears the override.
    #[serde(default)]
    pub level: Option<DegradationLevel>,
}

// PUT /api/degradation/override
pub async fn degradation_override(
    State(state): State<Arc<AppState>>,
    Json(body): Json<OverrideBody>,
) -> Json<serde_json::Value> {
    let degradation = &state.service.deps().degradation;
    match body.level {
        Some(level) => {
            info!(level = %level, "Degradation level pinned");
            degradation.pin(level);
        }
        None => {
            info!("Degradation override cleared");
            degradation.unpin();
        }
    }
    Json(serde_json::json!({
        "level": degradation.level(),
        "pinned": degradation.pinned().is_some(),
    }))
}

#[derive(Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub session_id: Option<String>,
}

// GET /ws?session_id=
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    let session = q
        .session_id
        .filter(|s| !s.is_empty())
        .map(|s| SessionId::from_string(&s))
        .unwrap_or_else(SessionId::new);
    ws.on_upgrade(move |socket| handle_ws(socket, session, state))
}

async fn handle_ws(socket: WebSocket, session: SessionId, state: Arc<AppState>) {
    info!(session_id = %session, "WebSocket client connected");
    socket::handle_socket(socket, session, state).await;
}
