// Location: src/model/tokenizer.rs

use std::path::Path;

use anyhow::anyhow;
use tokenizers::{Tokenizer as HfTokenizer, TruncationParams};

use crate::error::{AdvisorError, Result};

/// End-of-sequence spellings used by the Llama family of tokenizers.
const EOS_CANDIDATES: &[&str] = &["</s>", "<|end_of_text|>", "<|eot_id|>"];

/// Tokenizer for prompts, truncating input to the model's context length.
#[derive(Clone)]
pub struct PromptTokenizer {
    /// HuggingFace tokenizer
    tokenizer: HfTokenizer,
    /// Maximum number of prompt tokens kept after truncation
    model_max_length: usize,
}

impl PromptTokenizer {
    /// Load `tokenizer.json` and configure truncation.
    pub fn from_file(path: impl AsRef<Path>, model_max_length: usize) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let tokenizer = HfTokenizer::from_file(path)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", path.display(), e))?;

        Self::new(tokenizer, model_max_length)
    }

    pub fn new(mut tokenizer: HfTokenizer, model_max_length: usize) -> anyhow::Result<Self> {
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: model_max_length,
                ..Default::default()
            }))
            .map_err(|e| anyhow!("Failed to configure truncation: {}", e))?;

        Ok(Self {
            tokenizer,
            model_max_length,
        })
    }

    /// Encode text to token IDs, adding the model's special tokens.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| AdvisorError::Inference {
                message: format!("Tokenization failed: {}", e),
                source: Some(e),
            })?;

        Ok(encoding.get_ids().to_vec())
    }

    /// Decode token IDs back to text, skipping special tokens.
    pub fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| AdvisorError::Inference {
                message: format!("Decoding failed: {}", e),
                source: Some(e),
            })
    }

    /// IDs of every end-of-sequence token this vocabulary knows about.
    pub fn eos_token_ids(&self) -> Vec<u32> {
        EOS_CANDIDATES
            .iter()
            .filter_map(|token| self.tokenizer.token_to_id(token))
            .collect()
    }

    pub fn model_max_length(&self) -> usize {
        self.model_max_length
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokenizers::models::wordlevel::WordLevel;
    use tokenizers::pre_tokenizers::whitespace::Whitespace;

    /// Whitespace word-level tokenizer over a tiny vocabulary.
    pub(crate) fn word_tokenizer(words: &[&str]) -> HfTokenizer {
        let mut vocab: HashMap<String, u32> = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.to_string(), i as u32 + 2))
            .collect();
        vocab.insert("<unk>".to_string(), 0);
        vocab.insert("</s>".to_string(), 1);

        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("<unk>".to_string())
            .build()
            .unwrap();

        let mut tokenizer = HfTokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace {}));
        tokenizer
    }

    #[test]
    fn test_basic_tokenization() {
        let tokenizer = PromptTokenizer::new(word_tokenizer(&["hello", "world"]), 16).unwrap();

        let tokens = tokenizer.encode("hello world").unwrap();
        assert_eq!(tokens, vec![2, 3]);
        assert_eq!(tokenizer.eos_token_ids(), vec![1]);
        assert_eq!(tokenizer.model_max_length(), 16);
    }

    #[test]
    fn test_missing_tokenizer_file_is_not_an_inference_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");

        let error = match PromptTokenizer::from_file(&path, 16) {
            Ok(_) => panic!("a missing tokenizer.json must not load"),
            Err(e) => e.to_string(),
        };
        assert!(error.starts_with("Failed to load tokenizer from"), "error: {}", error);
        assert!(!error.contains("Inference error"));
    }

    #[test]
    fn test_truncation_to_context_length() {
        let tokenizer = PromptTokenizer::new(word_tokenizer(&["a", "b"]), 3).unwrap();

        let tokens = tokenizer.encode("a b a b a b").unwrap();
        assert_eq!(tokens.len(), 3);
    }
}
