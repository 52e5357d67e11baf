//! `/v_beta/apps` CRUD over the scheduler's command interface.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use bosun_id::AppId;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::ApiState;
use crate::state::Version;

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/apps", post(create_app).get(list_apps))
        .route(
            "/apps/{app_id}",
            get(get_app).delete(delete_app).put(update_app),
        )
        .route("/apps/{app_id}/scale-up", post(scale_up))
        .route("/apps/{app_id}/scale-down", post(scale_down))
        .route("/apps/{app_id}/update/proceed", post(proceed_update))
        .route("/apps/{app_id}/update/cancel", post(cancel_update))
}

fn parse_app_id(raw: &str) -> Result<AppId, ApiError> {
    AppId::parse(raw).map_err(|e| ApiError::bad_request("bad_app_id", e.to_string()))
}

async fn create_app(
    State(state): State<ApiState>,
    Json(version): Json<Version>,
) -> Result<impl IntoResponse, ApiError> {
    let view = state.scheduler.create_app(version).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn list_apps(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.scheduler.list_apps())
}

async fn get_app(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let app_id = parse_app_id(&app_id)?;
    state
        .scheduler
        .get_app(&app_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("app {app_id} not found")))
}

async fn delete_app(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let app_id = parse_app_id(&app_id)?;
    state.scheduler.delete_app(app_id).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn update_app(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
    Json(version): Json<Version>,
) -> Result<impl IntoResponse, ApiError> {
    let app_id = parse_app_id(&app_id)?;
    state.scheduler.update_app(app_id, version).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct ScaleUpRequest {
    instances: u32,
    #[serde(default)]
    ips: Vec<String>,
}

async fn scale_up(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
    Json(body): Json<ScaleUpRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let app_id = parse_app_id(&app_id)?;
    state
        .scheduler
        .scale_up(app_id, body.instances, body.ips)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct ScaleDownRequest {
    instances: u32,
}

async fn scale_down(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
    Json(body): Json<ScaleDownRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let app_id = parse_app_id(&app_id)?;
    state.scheduler.scale_down(app_id, body.instances).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
struct ProceedRequest {
    instances: u32,
}

async fn proceed_update(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
    Json(body): Json<ProceedRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let app_id = parse_app_id(&app_id)?;
    state
        .scheduler
        .proceed_update(app_id, body.instances)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn cancel_update(
    State(state): State<ApiState>,
    Path(app_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let app_id = parse_app_id(&app_id)?;
    state.scheduler.cancel_update(app_id).await?;
    Ok(StatusCode::ACCEPTED)
}
