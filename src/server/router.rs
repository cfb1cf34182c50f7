use axum::Router;
use axum::routing::{delete, get, post};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::sandbox::Sandboxes;

/// Build the API router
pub fn build_router(sandboxes: Arc<Sandboxes>) -> Router {
    let containers = Router::new()
        .route("/", get(handlers::list))
        .route("/create", post(handlers::create))
        .route("/{id}", delete(handlers::remove))
        .route("/{id}/start", post(handlers::start))
        .route("/{id}/stop", post(handlers::stop))
        .route("/{id}/files", get(handlers::list_files).put(handlers::write_files))
        .route("/{id}/file-tree", get(handlers::file_tree))
        .route("/{id}/file-content-tree", get(handlers::file_content_tree))
        .route("/{id}/file", get(handlers::read_file).put(handlers::write_file))
        .route("/{id}/logs", get(handlers::logs))
        .route(
            "/{id}/package",
            get(handlers::read_manifest).put(handlers::write_manifest),
        )
        .route("/{id}/export", post(handlers::export));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/containers", containers)
        .layer(TraceLayer::new_for_http())
        .with_state(sandboxes)
}
