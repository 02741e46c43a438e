use std::sync::Arc;

use crate::{
    config::Settings,
    error::{AdvisorError, Result},
    gpu::ComputeDevice,
    model::ModelLoader,
};

use super::engine::AdvisorEngine;

/// Builder for constructing an AdvisorEngine instance
pub struct EngineBuilder {
    settings: Option<Settings>,
    device: Option<ComputeDevice>,
}

impl EngineBuilder {
    /// Create a new builder instance
    pub fn new() -> Self {
        Self {
            settings: None,
            device: None,
        }
    }

    /// Set the resolved settings
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Pin the compute device instead of auto-detecting it
    pub fn with_device(mut self, device: ComputeDevice) -> Self {
        self.device = Some(device);
        self
    }

    /// Validate settings and load the model. Loading runs on a blocking thread.
    pub async fn build(self) -> Result<AdvisorEngine> {
        let settings = match self.settings {
            Some(settings) => settings,
            None => Settings::from_env()?,
        };
        settings.validate()?;

        let device = self.device;
        let model = settings.base_model.clone();
        let (profile, quantization) = (settings.profile, settings.quantization);

        let (settings, bundle) = tokio::task::spawn_blocking(move || {
            let mut loader = ModelLoader::new(&settings);
            if let Some(device) = device {
                loader = loader.with_device(device);
            }
            let bundle = loader.load();
            (settings, bundle)
        })
        .await
        .map_err(|e| AdvisorError::ModelLoad {
            model,
            profile,
            quantization,
            source: Box::new(e),
        })?;
        let bundle = bundle?;

        let adapter = bundle.adapter().clone();
        Ok(AdvisorEngine::with_adapter(settings, Arc::new(bundle), adapter))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawSettings;
    use crate::model::tests::write_tiny_llama;
    use crate::model::AdapterStatus;
    use crate::types::PredictRequest;

    #[tokio::test]
    async fn test_builder_rejects_invalid_settings() {
        let mut settings = RawSettings::default().resolve();
        settings.top_p = 0.0;

        let result = EngineBuilder::default()
            .with_settings(settings)
            .with_device(ComputeDevice::cpu())
            .build()
            .await;
        assert!(matches!(result, Err(AdvisorError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_builder_surfaces_model_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RawSettings {
            base_model: Some(dir.path().to_string_lossy().into_owned()),
            model_cache: dir.path().join("cache"),
            ..Default::default()
        }
        .resolve();

        let result = AdvisorEngine::builder()
            .with_settings(settings)
            .with_device(ComputeDevice::cpu())
            .build()
            .await;
        assert!(matches!(result, Err(AdvisorError::ModelLoad { .. })));
    }

    #[tokio::test]
    async fn test_builder_reports_incomplete_checkpoint_as_model_load() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("model");
        write_tiny_llama(&model_dir, false);
        let settings = RawSettings {
            base_model: Some(model_dir.to_string_lossy().into_owned()),
            model_cache: dir.path().join("cache"),
            ..Default::default()
        }
        .resolve();

        let error = match AdvisorEngine::builder()
            .with_settings(settings)
            .with_device(ComputeDevice::cpu())
            .build()
            .await
        {
            Ok(_) => panic!("a checkpoint without layers must not load"),
            Err(e) => e,
        };
        assert!(matches!(error, AdvisorError::ModelLoad { .. }), "got {:?}", error);
        assert!(error.to_string().contains("model.layers.0"));
    }

    #[tokio::test]
    async fn test_built_engine_serves_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("model");
        write_tiny_llama(&model_dir, true);
        let settings = RawSettings {
            base_model: Some(model_dir.to_string_lossy().into_owned()),
            model_cache: dir.path().join("cache"),
            max_new_tokens: 4,
            ..Default::default()
        }
        .resolve();

        let engine = AdvisorEngine::builder()
            .with_settings(settings)
            .with_device(ComputeDevice::cpu())
            .build()
            .await
            .unwrap();
        assert_eq!(engine.adapter(), &AdapterStatus::NotConfigured);

        let response = engine
            .predict(PredictRequest {
                instruction: "a b".to_string(),
                input: "c d".to_string(),
            })
            .await
            .unwrap();
        assert!(!response.prediction.is_empty());
    }
}
