//! System status and cleanup handlers.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use super::{ApiError, AppState};

/// GET /api/v1/status
pub async fn system_status(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let count = state.catalog().count()?;

    Ok(Json(json!({
        "status": "healthy",
        "image_count": count,
        "version": env!("CARGO_PKG_VERSION"),
    })))
}

/// POST /api/v1/cleanup
pub async fn run_cleanup(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.blobs().cleanup()?;
    Ok(Json(json!({"status": "cleanup completed"})))
}
