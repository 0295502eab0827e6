//! HTTP handlers for the control plane

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::browser::ChromiumDriver;
use crate::config::{StartOverrides, UserConfig};
use crate::events::StatusSnapshot;
use crate::supervisor::{SessionView, Supervisor};

use super::AppState;

/// Default and maximum tail sizes for `GET /api/logs`
const DEFAULT_LOG_LINES: usize = 1000;
const MAX_LOG_LINES: usize = 5000;

// -- Response types -----------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: chrono::DateTime<Utc>,
    pub monitoring_active: bool,
}

#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub lines: Option<usize>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        Json(serde_json::json!({ "ok": false, "error": message.into() })),
    )
        .into_response()
}

// -- Handlers -----------------------------------------------------------------

/// `GET /api/health`
pub async fn health(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    let monitoring_active = s.monitor.lock().await.is_some();
    Json(HealthResponse {
        status: "running",
        timestamp: Utc::now(),
        monitoring_active,
    })
}

/// `GET /api/config`
pub async fn get_config(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    Json(s.config_store.current())
}

/// `POST /api/config` — persist the user config document
pub async fn post_config(
    State(s): State<Arc<AppState>>,
    Json(config): Json<UserConfig>,
) -> impl IntoResponse {
    match s.config_store.save(config) {
        Ok(()) => Json(AckResponse {
            ok: true,
            message: "config saved".to_string(),
        })
        .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// `POST /api/start-monitoring` — resolve config (request override wins) and
/// start a Supervisor run
pub async fn start_monitoring(
    State(s): State<Arc<AppState>>,
    body: Option<Json<StartOverrides>>,
) -> impl IntoResponse {
    let mut monitor = s.monitor.lock().await;
    if monitor.is_some() {
        return error_response(StatusCode::CONFLICT, "monitoring already active");
    }

    let overrides = body.map(|Json(b)| b).unwrap_or_default();
    let mut config = match s.config_store.resolve(&overrides, &s.storage_root) {
        Ok(config) => config,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    config.headless = s.headless;

    let driver = Arc::new(ChromiumDriver::new(config.headless));
    match Supervisor::start(config, driver, s.log.clone(), s.bus.clone()).await {
        Ok(supervisor) => {
            *monitor = Some(supervisor);
            Json(AckResponse {
                ok: true,
                message: "monitoring started".to_string(),
            })
            .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start monitoring");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// `POST /api/stop-monitoring`
pub async fn stop_monitoring(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    let supervisor = s.monitor.lock().await.take();
    match supervisor {
        Some(supervisor) => {
            supervisor.stop().await;
            Json(AckResponse {
                ok: true,
                message: "monitoring stopped".to_string(),
            })
            .into_response()
        }
        None => error_response(StatusCode::CONFLICT, "monitoring not active"),
    }
}

/// `GET /api/status`
pub async fn status(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    let monitor = s.monitor.lock().await;
    let status = match monitor.as_ref() {
        Some(supervisor) => supervisor.status().await,
        None => StatusSnapshot {
            monitoring_active: false,
            global_limit_active: false,
            reactivation_time: None,
        },
    };
    Json(status)
}

/// `GET /api/statistics` — the vote log's process-lifetime counters
pub async fn statistics(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    Json(s.log.session_stats())
}

/// `GET /api/instances`
pub async fn instances(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    let monitor = s.monitor.lock().await;
    let list = match monitor.as_ref() {
        Some(supervisor) => supervisor.instances().await,
        None => Vec::new(),
    };
    Json(list)
}

/// `GET /api/sessions` — store contents merged with live workers; live wins
pub async fn sessions(State(s): State<Arc<AppState>>) -> impl IntoResponse {
    let monitor = s.monitor.lock().await;
    if let Some(supervisor) = monitor.as_ref() {
        return match supervisor.sessions().await {
            Ok(views) => Json(views).into_response(),
            Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        };
    }
    drop(monitor);

    // No run active: serve the store as-is.
    let ids = match s.store.list().await {
        Ok(ids) => ids,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let mut views = Vec::with_capacity(ids.len());
    for instance_id in ids {
        let info = s.store.load(instance_id).await.ok().map(|r| r.info);
        views.push(SessionView {
            instance_id,
            proxy_ip: info.as_ref().and_then(|i| i.proxy_ip.clone()),
            session_id: info.as_ref().and_then(|i| i.session_id.clone()),
            last_vote_time: info.as_ref().and_then(|i| i.last_vote_time),
            vote_count: info.as_ref().map(|i| i.vote_count).unwrap_or(0),
            live: false,
            state: None,
        });
    }
    Json(views).into_response()
}

/// `GET /api/logs?lines=N` — ring-buffer tail (default 1000, cap 5000)
pub async fn logs(
    State(s): State<Arc<AppState>>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let lines = query
        .lines
        .unwrap_or(DEFAULT_LOG_LINES)
        .min(MAX_LOG_LINES);
    Json(s.bus.log_tail(lines))
}
