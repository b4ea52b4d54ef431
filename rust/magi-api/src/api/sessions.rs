//! Session management endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use magi_core::engine::SessionOptions;
use magi_core::error::MagiError;
use magi_core::events::Phase;

use crate::runtime::CancelStatus;
use crate::AppState;

/// Prompt length bounds in code points.
const PROMPT_MIN: usize = 1;
const PROMPT_MAX: usize = 8000;

/// Session routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", get(get_session))
        .route("/api/sessions/{id}/cancel", post(cancel_session))
}

/// Create session request.
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    /// The deliberation prompt.
    pub prompt: String,
    /// Optional per-session overrides.
    #[serde(default)]
    pub options: Option<SessionOptions>,
}

/// Create session response.
#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
    pub ws_url: String,
    pub status: Phase,
}

/// Human-readable validation failure.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

fn error_body(message: impl Into<String>) -> Json<ErrorBody> {
    Json(ErrorBody {
        error: message.into(),
    })
}

/// Create a new deliberation session.
///
/// # Errors
///
/// Returns 400 on prompt validation failure, 429 when the running-session
/// limit is reached.
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    let length = request.prompt.chars().count();
    if length < PROMPT_MIN {
        return (
            StatusCode::BAD_REQUEST,
            error_body("prompt must not be empty"),
        )
            .into_response();
    }
    if length > PROMPT_MAX {
        return (
            StatusCode::BAD_REQUEST,
            error_body(format!(
                "prompt exceeds {PROMPT_MAX} characters (got {length})"
            )),
        )
            .into_response();
    }

    let options = request.options.unwrap_or_default();
    match state.sessions.create(request.prompt, options).await {
        Ok(session_id) => {
            let response = CreateSessionResponse {
                session_id,
                ws_url: format!("/ws/sessions/{session_id}"),
                status: Phase::Queued,
            };
            (StatusCode::CREATED, Json(response)).into_response()
        }
        Err(MagiError::ConcurrencyLimit { .. }) => (
            StatusCode::TOO_MANY_REQUESTS,
            error_body("session concurrency limit reached"),
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "session creation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("session creation failed"),
            )
                .into_response()
        }
    }
}

/// Cancel response.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub status: CancelStatus,
}

/// Request cancellation of a session.
///
/// Repeating cancel on a terminal session is a no-op that reports the
/// terminal status again.
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.sessions.cancel(id) {
        Some(status) => (StatusCode::OK, Json(CancelResponse { status })).into_response(),
        None => (StatusCode::NOT_FOUND, error_body("unknown session")).into_response(),
    }
}

/// Snapshot a session's observable state.
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.sessions.get(id) {
        Some(session) => (StatusCode::OK, Json(session)).into_response(),
        None => (StatusCode::NOT_FOUND, error_body("unknown session")).into_response(),
    }
}
