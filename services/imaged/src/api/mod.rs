//! HTTP/JSON control surface.
//!
//! The API is a thin adapter over the catalog and blob store: it inserts,
//! reads, and deletes rows and triggers cleanup, but never performs the
//! worker's side effects.

pub mod error;
mod images;
mod status;

use std::sync::Arc;

use axum::{
    http::{header, Method},
    response::Html,
    routing::{get, post},
    Router,
};
use tokio::sync::Notify;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::blobstore::BlobStore;
use crate::catalog::Catalog;
use crate::layout::StorageLayout;
use crate::overlay::OverlayManager;

pub use error::ApiError;

/// Shared application state, passed to handlers via Axum's state
/// extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    catalog: Arc<Catalog>,
    blobs: Arc<BlobStore>,
    overlay: Arc<OverlayManager>,
    layout: StorageLayout,
    wake: Arc<Notify>,
}

impl AppState {
    pub fn new(
        catalog: Arc<Catalog>,
        blobs: Arc<BlobStore>,
        overlay: Arc<OverlayManager>,
        layout: StorageLayout,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                catalog,
                blobs,
                overlay,
                layout,
                wake,
            }),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.inner.blobs
    }

    pub fn overlay(&self) -> &OverlayManager {
        &self.inner.overlay
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.inner.layout
    }

    /// Signal the worker that new work may be available.
    pub fn wake_worker(&self) {
        self.inner.wake.notify_one();
    }
}

/// Create the main router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        .route("/", get(index))
        .route(
            "/api/v1/images",
            get(images::list_images)
                .post(images::create_image)
                .fallback(error::method_not_allowed),
        )
        .route(
            "/api/v1/images/{name}",
            get(images::get_image)
                .delete(images::delete_image)
                .fallback(error::method_not_allowed),
        )
        .route(
            "/api/v1/status",
            get(status::system_status).fallback(error::method_not_allowed),
        )
        .route(
            "/api/v1/cleanup",
            post(status::run_cleanup).fallback(error::method_not_allowed),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head><title>Image Store</title></head>
<body>
<h1>Image Store API</h1>
<p>Available endpoints:</p>
<ul>
<li>GET /api/v1/images - List all images</li>
<li>POST /api/v1/images - Create new image</li>
<li>GET /api/v1/images/{name} - Get image status</li>
<li>DELETE /api/v1/images/{name} - Remove image</li>
<li>GET /api/v1/status - System status</li>
<li>POST /api/v1/cleanup - Cleanup unused blobs</li>
</ul>
</body>
</html>"#,
    )
}
