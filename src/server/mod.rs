//! HTTP + WebSocket control plane
//!
//! Thin surface over the supervisor, config store, vote log and the
//! observation bus. Start/stop swap the running [`Supervisor`] behind a
//! mutex; everything else is read-only views.

mod http;
mod ws;

use axum::routing::{get, post};
use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ConfigStore;
use crate::events::ObservationBus;
use crate::session_store::SessionStore;
use crate::supervisor::Supervisor;
use crate::vote_log::VoteLog;

/// Shared state behind every handler
pub struct AppState {
    pub storage_root: PathBuf,
    pub config_store: Arc<ConfigStore>,
    pub bus: ObservationBus,
    pub log: VoteLog,
    pub store: SessionStore,
    pub headless: bool,
    /// `Some` while monitoring is active
    pub monitor: Mutex<Option<Supervisor>>,
}

/// Build the control-plane router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(http::health))
        .route("/api/config", get(http::get_config).post(http::post_config))
        .route("/api/start-monitoring", post(http::start_monitoring))
        .route("/api/stop-monitoring", post(http::stop_monitoring))
        .route("/api/status", get(http::status))
        .route("/api/statistics", get(http::statistics))
        .route("/api/instances", get(http::instances))
        .route("/api/sessions", get(http::sessions))
        .route("/api/logs", get(http::logs))
        .route("/ws", get(ws::upgrade))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
