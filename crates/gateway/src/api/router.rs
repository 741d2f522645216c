//! Route table.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

use super::{admin, chat, permissions};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(chat::chat))
        .route("/api/permissions/pending", get(permissions::pending))
        .route("/api/permissions/:id/resolve", post(permissions::resolve))
        .route("/api/health", get(admin::health))
        .route("/api/admin/reload-workflows", post(admin::reload_workflows))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
