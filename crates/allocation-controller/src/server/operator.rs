//! Operator endpoints.
//!
//! `POST /session/start` arms the scheduler (idempotent) and
//! `GET /session/state` returns the full observable session state. Both are
//! plain JSON over HTTP; neither carries claimant tokens.

use super::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;
use tracing::error;

/// `POST /session/start` - arm the start-time scheduler.
///
/// Repeated calls return 200 with a diagnostic noting the timer was already
/// armed; only the first call spawns it.
pub async fn start_session(State(state): State<AppState>) -> Response {
    let diagnostic = state.scheduler.start();
    (StatusCode::OK, Json(json!({ "status": diagnostic }))).into_response()
}

/// `GET /session/state` - the phase, every claimant's progress (by display
/// name), and the claim map.
pub async fn session_state(State(state): State<AppState>) -> Response {
    match state.session.get_state().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => {
            error!(target: "alloc.server", error = %e, "Failed to fetch session state");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "session state unavailable" })),
            )
                .into_response()
        }
    }
}
