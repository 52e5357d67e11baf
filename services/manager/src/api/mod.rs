//! HTTP API: thin CRUD over the scheduler's command interface.

pub mod error;

mod apps;
mod health;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::scheduler::{Metrics, SchedulerHandle};

/// State shared with every request handler.
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: SchedulerHandle,
    pub metrics: Arc<Metrics>,
}

/// Builds the router: health at the root, app CRUD under `/v_beta`.
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .merge(health::routes())
        .nest("/v_beta", apps::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
