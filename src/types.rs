//! Request and response bodies of the HTTP API

use serde::{Deserialize, Serialize};

use crate::config::{Profile, Quantization};
use crate::gpu::DeviceKind;

/// Body of `POST /predict`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictRequest {
    /// Task description
    pub instruction: String,
    /// Free-form context for the task
    pub input: String,
}

/// Successful `POST /predict` result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictResponse {
    /// Generated text with the prompt echo removed
    pub prediction: String,
}

/// `GET /health` snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub profile: Profile,
    pub base_model: String,
    pub adapter_active: bool,
    pub quantization: Quantization,
    pub device: DeviceKind,
    pub max_new_tokens: usize,
}

/// Error payload returned with non-2xx responses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}
