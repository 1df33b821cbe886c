//! Client-facing HTTP surface: the claimant WebSocket endpoint and the
//! operator endpoints, on one router.

pub mod operator;
pub mod ws;

use crate::session::{ConnectionRegistry, SessionHandle, SessionScheduler};
use axum::routing::{get, post};
use axum::Router;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared state for the API router.
#[derive(Clone)]
pub struct AppState {
    /// Admission pipeline handle.
    pub session: SessionHandle,
    /// Live connection registry.
    pub registry: Arc<ConnectionRegistry>,
    /// Start-time scheduler.
    pub scheduler: Arc<SessionScheduler>,
    /// Static token to display-name table, for connection-time validation.
    /// The claimant set is fixed at boot, so no lock is needed.
    pub claimants: Arc<HashMap<String, String>>,
}

/// Build the client-facing API router.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/:token", get(ws::ws_handler))
        .route("/session/start", post(operator::start_session))
        .route("/session/state", get(operator::session_state))
        .with_state(state)
}
