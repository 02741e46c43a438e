//! HTTP handlers for the advisor API

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};

use super::routes::AppState;
use crate::error::AdvisorError;
use crate::types::{ErrorBody, HealthResponse, PredictRequest, PredictResponse};

/// Error returned to HTTP clients as `{"detail": ...}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl From<AdvisorError> for ApiError {
    fn from(error: AdvisorError) -> Self {
        let detail = match &error {
            AdvisorError::Inference { .. } => error.to_string(),
            other => format!("Inference error: {}", other),
        };

        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { detail: self.detail })).into_response()
    }
}

/// Service and model status
pub async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(state.engine.health())
}

/// Generate a response for an instruction + input pair
pub async fn predict(
    State(state): State<AppState>,
    Json(request): Json<PredictRequest>,
) -> Result<Json<PredictResponse>, ApiError> {
    match state.engine.predict(request).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            tracing::error!(error = %e, details = ?e, "Prediction failed");
            Err(e.into())
        }
    }
}
