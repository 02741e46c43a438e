//! Model loading, LoRA adapters and text generation

mod adapter;
mod loader;
mod runtime;
mod tokenizer;

use std::sync::Arc;

pub use adapter::{
    find_adapter_files, locate_adapter, AdapterSource, AdapterStatus, WeightMap,
    ADAPTER_FILE_PREFIX,
};
pub use loader::ModelLoader;
pub use runtime::{extract_response, format_prompt, Backbone, ModelRuntime, RESPONSE_MARKER};
pub use tokenizer::PromptTokenizer;

use crate::config::GenerationConfig;
use crate::engine::TextGenerator;
use crate::error::{AdvisorError, Result};
use crate::gpu::DeviceKind;

/// Everything loaded at startup: tokenizer, weights, device and what
/// happened to the adapter. Never mutated after construction.
pub struct ModelBundle {
    runtime: Arc<ModelRuntime>,
    adapter: AdapterStatus,
}

impl ModelBundle {
    pub fn new(runtime: ModelRuntime, adapter: AdapterStatus) -> Self {
        Self {
            runtime: Arc::new(runtime),
            adapter,
        }
    }

    pub fn adapter(&self) -> &AdapterStatus {
        &self.adapter
    }
}

#[async_trait::async_trait]
impl TextGenerator for ModelBundle {
    async fn generate(&self, prompt: String, params: GenerationConfig) -> Result<String> {
        let runtime = Arc::clone(&self.runtime);
        tokio::task::spawn_blocking(move || runtime.generate(&prompt, &params))
            .await
            .map_err(AdvisorError::inference)?
    }

    fn device(&self) -> DeviceKind {
        self.runtime.device().kind
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;
    use std::path::Path;

    use candle_core::{DType, Device, Tensor};

    use super::tokenizer::tests::word_tokenizer;

    pub(crate) const HIDDEN: usize = 8;
    const INTERMEDIATE: usize = 16;
    /// `<unk>`, `</s>`, then the fixture words
    pub(crate) const WORDS: &[&str] = &["a", "b", "c", "d"];

    /// Write a one-layer Llama checkpoint (`config.json`, `tokenizer.json`,
    /// `model.safetensors`) into `dir`. Without layers only the embeddings,
    /// final norm and head are stored.
    pub(crate) fn write_tiny_llama(dir: &Path, with_layers: bool) {
        std::fs::create_dir_all(dir).unwrap();
        let vocab_size = WORDS.len() + 2;

        let config = serde_json::json!({
            "architectures": ["LlamaForCausalLM"],
            "hidden_size": HIDDEN,
            "intermediate_size": INTERMEDIATE,
            "vocab_size": vocab_size,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "num_key_value_heads": 2,
            "rms_norm_eps": 1e-5,
            "rope_theta": 10000.0,
            "max_position_embeddings": 128,
            "bos_token_id": 0,
            "eos_token_id": 1,
            "tie_word_embeddings": false,
        });
        std::fs::write(dir.join("config.json"), config.to_string()).unwrap();

        word_tokenizer(WORDS)
            .save(dir.join("tokenizer.json"), false)
            .unwrap();

        let random = |shape: &[usize]| Tensor::randn(0f32, 0.5, shape, &Device::Cpu).unwrap();
        let ones = |size: usize| Tensor::ones(size, DType::F32, &Device::Cpu).unwrap();

        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        tensors.insert("model.embed_tokens.weight".into(), random(&[vocab_size, HIDDEN]));
        tensors.insert("model.norm.weight".into(), ones(HIDDEN));
        tensors.insert("lm_head.weight".into(), random(&[vocab_size, HIDDEN]));

        if with_layers {
            let layer = "model.layers.0";
            for proj in ["q_proj", "k_proj", "v_proj", "o_proj"] {
                tensors.insert(
                    format!("{layer}.self_attn.{proj}.weight"),
                    random(&[HIDDEN, HIDDEN]),
                );
            }
            for proj in ["gate_proj", "up_proj"] {
                tensors.insert(
                    format!("{layer}.mlp.{proj}.weight"),
                    random(&[INTERMEDIATE, HIDDEN]),
                );
            }
            tensors.insert(
                format!("{layer}.mlp.down_proj.weight"),
                random(&[HIDDEN, INTERMEDIATE]),
            );
            tensors.insert(format!("{layer}.input_layernorm.weight"), ones(HIDDEN));
            tensors.insert(format!("{layer}.post_attention_layernorm.weight"), ones(HIDDEN));
        }

        candle_core::safetensors::save(&tensors, dir.join("model.safetensors")).unwrap();
    }

    /// Rank-1 LoRA on the first layer's `q_proj`, in PEFT's file layout.
    pub(crate) fn write_q_proj_adapter(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        let config = serde_json::json!({
            "r": 1,
            "lora_alpha": 2,
            "target_modules": ["q_proj"],
            "peft_type": "LORA",
        });
        std::fs::write(dir.join("adapter_config.json"), config.to_string()).unwrap();

        let prefix = "base_model.model.model.layers.0.self_attn.q_proj";
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        tensors.insert(
            format!("{prefix}.lora_A.weight"),
            Tensor::ones((1, HIDDEN), DType::F32, &Device::Cpu).unwrap(),
        );
        tensors.insert(
            format!("{prefix}.lora_B.weight"),
            Tensor::ones((HIDDEN, 1), DType::F32, &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, dir.join("adapter_model.safetensors")).unwrap();
    }
}
