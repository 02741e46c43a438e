//! Network Advisor - HTTP inference service for an instruction-tuned LLM
//!
//! Resolves settings from the environment and an optional `.env` file, loads a
//! causal language model (optionally 4-bit quantized) with an optional LoRA
//! adapter merged into its weights, and serves `GET /health` and
//! `POST /predict` over HTTP.

pub mod config;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod model;
pub mod server;
pub mod types;
pub mod utils;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-exports for public API
pub use config::{GenerationConfig, Profile, Quantization, QuantizationMode, RawSettings, Settings};
pub use engine::{AdvisorEngine, EngineBuilder, TextGenerator};
pub use error::{AdvisorError, Result};
pub use gpu::{ComputeDevice, DeviceKind};
pub use model::{AdapterStatus, ModelBundle, ModelLoader};
pub use server::create_router;
pub use types::{HealthResponse, PredictRequest, PredictResponse};
