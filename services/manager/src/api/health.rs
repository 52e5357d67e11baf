//! Health and process-metrics endpoints.

use std::sync::atomic::Ordering;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::api::ApiState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
}

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/livez", get(livez))
        .route("/metrics", get(metrics))
}

async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "bosun-manager".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}

/// Plain-text process counters.
async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let apps = state.scheduler.list_apps();
    let running: u32 = apps.iter().map(|a| a.running_instances).sum();
    let body = format!(
        "bosun_apps {}\n\
         bosun_slots_running {}\n\
         bosun_broker_events_handled_total {}\n\
         bosun_commands_handled_total {}\n\
         bosun_tasks_reconciled_total {}\n\
         bosun_apps_reaped_total {}\n",
        apps.len(),
        running,
        state.metrics.events_handled.load(Ordering::Relaxed),
        state.metrics.commands_handled.load(Ordering::Relaxed),
        state.metrics.tasks_reconciled.load(Ordering::Relaxed),
        state.metrics.apps_reaped.load(Ordering::Relaxed),
    );
    (StatusCode::OK, body)
}
