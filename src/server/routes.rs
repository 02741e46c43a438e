//! HTTP routes for the advisor API

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use super::handlers::{get_health, predict};
use crate::engine::AdvisorEngine;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AdvisorEngine>,
}

/// Create the API router
pub fn create_router(engine: Arc<AdvisorEngine>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/predict", post(predict))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { engine })
}
