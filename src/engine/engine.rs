use std::sync::Arc;

use crate::{
    config::Settings,
    error::Result,
    gpu::DeviceKind,
    model::{extract_response, format_prompt, AdapterStatus},
    types::{HealthResponse, PredictRequest, PredictResponse},
};

use super::TextGenerator;

/// Application context built once at startup and shared by every request.
pub struct AdvisorEngine {
    settings: Arc<Settings>,
    generator: Arc<dyn TextGenerator>,
    adapter: AdapterStatus,
}

impl AdvisorEngine {
    /// Create a new engine builder
    pub fn builder() -> super::EngineBuilder {
        super::EngineBuilder::new()
    }

    /// Wrap an already constructed generator.
    pub fn new(settings: Settings, generator: Arc<dyn TextGenerator>) -> Self {
        Self::with_adapter(settings, generator, AdapterStatus::NotConfigured)
    }

    pub(crate) fn with_adapter(
        settings: Settings,
        generator: Arc<dyn TextGenerator>,
        adapter: AdapterStatus,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            generator,
            adapter,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Outcome of adapter loading, for diagnostics.
    pub fn adapter(&self) -> &AdapterStatus {
        &self.adapter
    }

    pub fn device(&self) -> DeviceKind {
        self.generator.device()
    }

    /// Static snapshot of the loaded configuration. `adapter_active` reflects
    /// the configured path, not whether the merge succeeded.
    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "ok".to_string(),
            profile: self.settings.profile,
            base_model: self.settings.base_model.clone(),
            adapter_active: self.settings.adapter_active(),
            quantization: self.settings.quantization,
            device: self.device(),
            max_new_tokens: self.settings.max_new_tokens,
        }
    }

    /// Format the prompt, generate, and strip the prompt echo.
    pub async fn predict(&self, request: PredictRequest) -> Result<PredictResponse> {
        let prompt = format_prompt(&request.instruction, &request.input);
        let decoded = self
            .generator
            .generate(prompt, self.settings.generation())
            .await?;

        Ok(PredictResponse {
            prediction: extract_response(&decoded),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Profile, RawSettings};
    use crate::engine::tests::{FailingGenerator, MockGenerator};
    use crate::error::AdvisorError;
    use std::path::PathBuf;

    fn engine_with_output(settings: Settings, output: &str) -> AdvisorEngine {
        AdvisorEngine::new(
            settings,
            Arc::new(MockGenerator {
                output: output.to_string(),
            }),
        )
    }

    #[tokio::test]
    async fn test_predict_extracts_response() {
        let engine = engine_with_output(
            RawSettings::default().resolve(),
            "Below is an instruction...\n### Response:\nOK",
        );

        let response = engine
            .predict(PredictRequest {
                instruction: "Summarize".to_string(),
                input: "x".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(response.prediction, "OK");
    }

    #[tokio::test]
    async fn test_predict_without_marker_returns_decoded_text() {
        let decoded = "  plain continuation without marker\n";
        let engine = engine_with_output(RawSettings::default().resolve(), decoded);

        let response = engine
            .predict(PredictRequest {
                instruction: "Summarize".to_string(),
                input: "x".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(response.prediction, decoded);
    }

    #[tokio::test]
    async fn test_predict_propagates_generation_failure() {
        let engine = AdvisorEngine::new(RawSettings::default().resolve(), Arc::new(FailingGenerator));

        let result = engine
            .predict(PredictRequest {
                instruction: "Summarize".to_string(),
                input: "x".to_string(),
            })
            .await;
        assert!(matches!(result, Err(AdvisorError::Inference { .. })));
    }

    #[test]
    fn test_health_snapshot() {
        let settings = RawSettings::for_profile(Profile::Prod).resolve();
        let engine = AdvisorEngine::new(settings, Arc::new(FailingGenerator));

        let health = engine.health();
        assert_eq!(health.status, "ok");
        assert_eq!(health.profile, Profile::Prod);
        assert_eq!(health.base_model, crate::config::PROD_BASE_MODEL);
        assert_eq!(health.device, DeviceKind::Gpu);
        assert_eq!(health.max_new_tokens, 256);
        assert!(health.adapter_active);
    }

    #[test]
    fn test_adapter_active_ignores_load_outcome() {
        let settings = RawSettings::for_profile(Profile::Prod).resolve();
        let engine = AdvisorEngine::with_adapter(
            settings,
            Arc::new(FailingGenerator),
            AdapterStatus::Missing {
                path: PathBuf::from(crate::config::PROD_ADAPTER_PATH),
            },
        );
        assert!(engine.health().adapter_active);
        assert!(!engine.adapter().is_applied());

        let engine = AdvisorEngine::new(RawSettings::default().resolve(), Arc::new(FailingGenerator));
        assert!(!engine.health().adapter_active);
    }
}
