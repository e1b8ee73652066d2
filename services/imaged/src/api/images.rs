//! Image CRUD handlers.

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::blobstore::is_valid_checksum;
use crate::catalog::ImageRecord;

use super::{ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct CreateImageRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    checksum: String,
}

#[derive(Debug, Serialize)]
pub struct ImageResponse {
    id: i64,
    name: String,
    blob_key: String,
    checksum: String,
    state: String,
    created_at: String,
    updated_at: String,
}

impl From<ImageRecord> for ImageResponse {
    fn from(record: ImageRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            blob_key: record.blob_url,
            checksum: record.checksum,
            state: record.state.as_str().to_string(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// GET /api/v1/images
pub async fn list_images(
    State(state): State<AppState>,
) -> Result<Json<Vec<ImageResponse>>, ApiError> {
    let images = state.catalog().list()?;
    Ok(Json(images.into_iter().map(Into::into).collect()))
}

/// POST /api/v1/images
pub async fn create_image(
    State(state): State<AppState>,
    payload: Result<Json<CreateImageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(req) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;

    if req.name.is_empty() || req.url.is_empty() || req.checksum.is_empty() {
        return Err(ApiError::bad_request("name, url, and checksum are required"));
    }

    if !is_valid_checksum(&req.checksum) {
        return Err(ApiError::bad_request(
            "checksum must be 64 lowercase hex characters",
        ));
    }

    state.catalog().enqueue(&req.name, &req.url, &req.checksum)?;
    state.wake_worker();

    Ok((
        StatusCode::CREATED,
        Json(json!({"status": "enqueued", "name": req.name})),
    ))
}

/// GET /api/v1/images/{name}
pub async fn get_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.catalog().get(&name)? {
        Some(record) => Ok(Json(
            json!({"name": record.name, "state": record.state.as_str()}),
        )),
        None => Err(ApiError::not_found(format!("image not found: {name}"))),
    }
}

/// DELETE /api/v1/images/{name}
///
/// Tears down the materialized state (mount, overlay triple, image root)
/// and removes the row. The blob file may be shared with other images and
/// is left for the cleanup sweep.
pub async fn delete_image(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    if let Err(e) = state.overlay().deactivate(&name) {
        warn!(image = %name, error = %e, "Failed to unmount overlay during delete");
    }

    for dir in [
        state.layout().active_dir(&name),
        state.layout().overlay_dir(&name),
        state.layout().image_dir(&name),
    ] {
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!(image = %name, path = %dir.display(), error = %e,
                    "Failed to remove directory during delete");
            }
        }
    }

    state.catalog().delete(&name)?;
    Ok(StatusCode::NO_CONTENT)
}
