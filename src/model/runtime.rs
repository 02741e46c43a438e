// Location: src/model/runtime.rs

use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::llama::{Cache, Config, Llama};
use candle_transformers::models::quantized_llama::ModelWeights as QuantizedLlama;
use parking_lot::Mutex;

use crate::config::GenerationConfig;
use crate::error::{AdvisorError, Result};
use crate::gpu::ComputeDevice;

use super::tokenizer::PromptTokenizer;

/// Marker after which the model's answer starts.
pub const RESPONSE_MARKER: &str = "### Response:";

/// Instruction/input prompt the adapter was fine-tuned on.
pub fn format_prompt(instruction: &str, input: &str) -> String {
    format!(
        "Below is an instruction that describes a task, paired with an input that provides further context. Write a response that appropriately completes the request.\n\n\
         ### Instruction:\n{}\n\n\
         ### Input:\n{}\n\n\
         {}\n",
        instruction, input, RESPONSE_MARKER
    )
}

/// Text after the last response marker, trimmed. Without a marker the
/// decoded text is returned as is.
pub fn extract_response(decoded: &str) -> String {
    match decoded.rfind(RESPONSE_MARKER) {
        Some(idx) => decoded[idx + RESPONSE_MARKER.len()..].trim().to_string(),
        None => decoded.to_string(),
    }
}

/// Model weights in one of the two supported layouts.
pub enum Backbone {
    /// Safetensors Llama; the KV cache is created per request
    Llama { model: Llama, config: Config },
    /// GGUF Llama; the KV cache lives inside the weights
    Quantized(Mutex<QuantizedLlama>),
}

/// Tokenizer, weights and device needed to run generation.
pub struct ModelRuntime {
    backbone: Backbone,
    tokenizer: PromptTokenizer,
    device: ComputeDevice,
    eos_token_ids: Vec<u32>,
}

impl ModelRuntime {
    pub fn new(
        backbone: Backbone,
        tokenizer: PromptTokenizer,
        device: ComputeDevice,
        eos_token_ids: Vec<u32>,
    ) -> Self {
        Self {
            backbone,
            tokenizer,
            device,
            eos_token_ids,
        }
    }

    pub fn device(&self) -> &ComputeDevice {
        &self.device
    }

    /// Generate a continuation and decode the whole sequence, prompt included.
    pub fn generate(&self, prompt: &str, params: &GenerationConfig) -> Result<String> {
        let start_time = std::time::Instant::now();

        let prompt_tokens = self.tokenizer.encode(prompt)?;
        if prompt_tokens.is_empty() {
            return Err(AdvisorError::Inference {
                message: "Prompt encoded to zero tokens".to_string(),
                source: None,
            });
        }
        let prompt_len = prompt_tokens.len();

        let mut logits_processor =
            LogitsProcessor::new(params.seed, Some(params.temperature), Some(params.top_p));
        let sampler = Sampler {
            device: &self.device.device,
            eos_token_ids: &self.eos_token_ids,
            max_context: self.tokenizer.model_max_length(),
        };

        let tokens = match &self.backbone {
            Backbone::Llama { model, config } => {
                let mut cache = Cache::new(true, self.device.dtype, config, &self.device.device)?;
                sampler.run(prompt_tokens, params, &mut logits_processor, |input, pos| {
                    model.forward(input, pos, &mut cache)
                })?
            }
            Backbone::Quantized(model) => {
                let mut model = model.lock();
                sampler.run(prompt_tokens, params, &mut logits_processor, |input, pos| {
                    model.forward(input, pos)
                })?
            }
        };

        tracing::debug!(
            prompt_tokens = prompt_len,
            generated_tokens = tokens.len() - prompt_len,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "generation finished"
        );

        self.tokenizer.decode(&tokens)
    }
}

/// Stop conditions shared by both backbones.
struct Sampler<'a> {
    device: &'a Device,
    eos_token_ids: &'a [u32],
    max_context: usize,
}

impl Sampler<'_> {
    /// Autoregressive loop. `forward` receives the new tokens as a `(1, n)`
    /// tensor and their start position, and returns `(1, vocab)` logits.
    fn run<F>(
        &self,
        mut tokens: Vec<u32>,
        params: &GenerationConfig,
        logits_processor: &mut LogitsProcessor,
        mut forward: F,
    ) -> Result<Vec<u32>>
    where
        F: FnMut(&Tensor, usize) -> candle_core::Result<Tensor>,
    {
        let mut index_pos = 0;

        for step in 0..params.max_new_tokens {
            if tokens.len() >= self.max_context {
                tracing::debug!(max_context = self.max_context, "context window full, stopping generation");
                break;
            }

            let context_size = if step > 0 { 1 } else { tokens.len() };
            let context = &tokens[tokens.len() - context_size..];
            let input = Tensor::new(context, self.device)?.unsqueeze(0)?;

            let logits = forward(&input, index_pos)?;
            let logits = logits.squeeze(0)?.to_dtype(DType::F32)?;
            index_pos += context.len();

            let next_token = logits_processor.sample(&logits)?;
            tokens.push(next_token);

            if self.eos_token_ids.contains(&next_token) {
                break;
            }
        }

        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const VOCAB: usize = 6;
    const EOS: u32 = 1;

    fn params(max_new_tokens: usize) -> GenerationConfig {
        GenerationConfig {
            max_new_tokens,
            temperature: 0.7,
            top_p: 0.9,
            seed: 42,
        }
    }

    /// `(1, VOCAB)` logits that put all probability mass on `token`.
    fn peaked(token: u32) -> candle_core::Result<Tensor> {
        let mut logits = vec![0f32; VOCAB];
        logits[token as usize] = 100.0;
        Tensor::new(logits.as_slice(), &Device::Cpu)?.unsqueeze(0)
    }

    fn run(
        prompt: Vec<u32>,
        max_context: usize,
        params: GenerationConfig,
        mut next: impl FnMut(usize) -> u32,
    ) -> (Vec<u32>, Vec<(Vec<u32>, usize)>) {
        let sampler = Sampler {
            device: &Device::Cpu,
            eos_token_ids: &[EOS],
            max_context,
        };
        let mut processor =
            LogitsProcessor::new(params.seed, Some(params.temperature), Some(params.top_p));
        let mut calls = Vec::new();

        let tokens = sampler
            .run(prompt, &params, &mut processor, |input, pos| {
                calls.push((input.squeeze(0)?.to_vec1::<u32>()?, pos));
                peaked(next(calls.len()))
            })
            .unwrap();
        (tokens, calls)
    }

    #[test]
    fn test_generation_is_capped_at_max_new_tokens() {
        let (tokens, calls) = run(vec![2, 3], 64, params(4), |_| 5);
        assert_eq!(tokens, vec![2, 3, 5, 5, 5, 5]);
        assert_eq!(calls.len(), 4);
    }

    #[test]
    fn test_generation_stops_at_eos() {
        let (tokens, calls) = run(vec![2, 3], 64, params(10), |call| if call == 3 { EOS } else { 4 });
        assert_eq!(tokens, vec![2, 3, 4, 4, EOS]);
        assert_eq!(calls.len(), 3);
    }

    #[test]
    fn test_generation_stops_when_context_is_full() {
        let (tokens, _) = run(vec![2, 3, 4], 5, params(10), |_| 5);
        assert_eq!(tokens, vec![2, 3, 4, 5, 5]);

        let (tokens, calls) = run(vec![2, 3, 4], 3, params(10), |_| 5);
        assert_eq!(tokens, vec![2, 3, 4]);
        assert!(calls.is_empty());
    }

    #[test]
    fn test_prompt_is_fed_once_then_one_token_per_step() {
        let (_, calls) = run(vec![2, 3, 4], 64, params(3), |call| call as u32 + 1);
        assert_eq!(
            calls,
            vec![(vec![2, 3, 4], 0), (vec![2], 3), (vec![3], 4)]
        );
    }

    #[test]
    fn test_prompt_template() {
        let prompt = format_prompt("Summarize", "x");
        assert_eq!(
            prompt,
            "Below is an instruction that describes a task, paired with an input that provides further context. Write a response that appropriately completes the request.\n\n### Instruction:\nSummarize\n\n### Input:\nx\n\n### Response:\n"
        );
    }

    #[test]
    fn test_extract_after_marker() {
        let decoded = format!("{}OK", format_prompt("Summarize", "x"));
        assert_eq!(extract_response(&decoded), "OK");
    }

    #[test]
    fn test_extract_uses_last_marker() {
        let decoded = "### Response: first\n### Response:\n  second answer \n";
        assert_eq!(extract_response(decoded), "second answer");
    }

    #[test]
    fn test_extract_without_marker_is_unchanged() {
        let decoded = "  no marker here \n";
        assert_eq!(extract_response(decoded), decoded);
    }

    #[test]
    fn test_extract_marker_at_end() {
        assert_eq!(extract_response("prompt ### Response:"), "");
    }
}
