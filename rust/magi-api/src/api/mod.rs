//! HTTP and WebSocket API endpoints.

pub mod health;
pub mod sessions;
pub mod streaming;

use axum::Router;

use crate::AppState;

/// All observer-facing routes.
pub fn create_router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(sessions::router())
        .merge(streaming::router())
}
