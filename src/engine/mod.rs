//! Engine module providing the application context shared by request handlers

mod builder;
mod engine;

pub use builder::EngineBuilder;
pub use engine::AdvisorEngine;

use crate::{config::GenerationConfig, error::Result, gpu::DeviceKind};

/// Anything that can turn a prompt into decoded text.
///
/// The returned text is the full decoded sequence, prompt echo included.
#[async_trait::async_trait]
pub trait TextGenerator: Send + Sync {
    /// Run generation for a single prompt
    async fn generate(&self, prompt: String, params: GenerationConfig) -> Result<String>;

    /// Device the generator runs on
    fn device(&self) -> DeviceKind;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::AdvisorError;

    /// Generator returning a fixed decoded text.
    pub(crate) struct MockGenerator {
        pub output: String,
    }

    #[async_trait::async_trait]
    impl TextGenerator for MockGenerator {
        async fn generate(&self, _prompt: String, _params: GenerationConfig) -> Result<String> {
            Ok(self.output.clone())
        }

        fn device(&self) -> DeviceKind {
            DeviceKind::Cpu
        }
    }

    /// Generator that always fails, like an out-of-memory during sampling.
    pub(crate) struct FailingGenerator;

    #[async_trait::async_trait]
    impl TextGenerator for FailingGenerator {
        async fn generate(&self, _prompt: String, _params: GenerationConfig) -> Result<String> {
            Err(AdvisorError::Inference {
                message: "CUDA out of memory".to_string(),
                source: None,
            })
        }

        fn device(&self) -> DeviceKind {
            DeviceKind::Gpu
        }
    }

    #[tokio::test]
    async fn test_mock_generator() {
        let generator = MockGenerator {
            output: "test".to_string(),
        };
        let params = crate::config::RawSettings::default().resolve().generation();
        let result = generator.generate("prompt".to_string(), params).await;
        assert_eq!(result.unwrap(), "test");
    }
}
