use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};

use super::state::DashboardState;
use crate::events::EventBus;
use crate::jobs::{Bucket, JobStore};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub store: JobStore,
    pub bus: EventBus,
    pub public_dir: PathBuf,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn snapshot(&self) -> Result<DashboardState, ApiError> {
        DashboardState::snapshot(&self.store, &self.bus).map_err(|e| ApiError::Internal(e.to_string()))
    }
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "dashboard request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/state", get(get_state))
        .route("/api/jobs/{bucket}", get(list_bucket))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn get_state(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.snapshot()?))
}

async fn list_bucket(
    State(state): State<SharedState>,
    Path(bucket): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let bucket: Bucket = bucket.parse().map_err(ApiError::BadRequest)?;
    let jobs = state
        .store
        .list(bucket)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(jobs))
}
