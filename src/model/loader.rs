use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use candle_core::Device;
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Config, Llama, LlamaConfig, LlamaEosToks};
use candle_transformers::models::quantized_llama::ModelWeights as QuantizedLlama;
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use parking_lot::Mutex;

use crate::config::{Quantization, Settings};
use crate::error::AdvisorError;
use crate::gpu::{self, ComputeDevice};

use super::adapter::{self, AdapterSource, AdapterStatus, WeightMap};
use super::runtime::{Backbone, ModelRuntime};
use super::tokenizer::PromptTokenizer;
use super::ModelBundle;

const TOKENIZER_FILE: &str = "tokenizer.json";
const CONFIG_FILE: &str = "config.json";
const SAFETENSORS_FILE: &str = "model.safetensors";
const SAFETENSORS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Context length assumed when a GGUF file does not record one.
const DEFAULT_CONTEXT_LENGTH: usize = 2048;

/// Where model files come from: a local directory or a hub repository.
enum ModelSource {
    Local(PathBuf),
    Hub { repo: ApiRepo, model_id: String },
}

impl ModelSource {
    fn open(settings: &Settings) -> Result<Self> {
        let local = Path::new(&settings.base_model);
        if local.is_dir() {
            tracing::info!(path = %local.display(), "loading model from local directory");
            return Ok(ModelSource::Local(local.to_path_buf()));
        }

        let api = ApiBuilder::new()
            .with_cache_dir(settings.model_cache.clone())
            .with_token(settings.hf_token.clone())
            .build()
            .context("Failed to create Hugging Face hub client")?;

        Ok(ModelSource::Hub {
            repo: api.model(settings.base_model.clone()),
            model_id: settings.base_model.clone(),
        })
    }

    /// Names of every file in the model.
    fn list(&self) -> Result<Vec<String>> {
        match self {
            ModelSource::Local(dir) => {
                let mut names = Vec::new();
                for entry in std::fs::read_dir(dir)
                    .with_context(|| format!("Failed to list {}", dir.display()))?
                {
                    let entry = entry?;
                    if entry.path().is_file() {
                        names.push(entry.file_name().to_string_lossy().into_owned());
                    }
                }
                names.sort();
                Ok(names)
            }
            ModelSource::Hub { repo, model_id } => {
                let info = repo
                    .info()
                    .with_context(|| format!("Failed to fetch repository info for {}", model_id))?;
                Ok(info.siblings.into_iter().map(|s| s.rfilename).collect())
            }
        }
    }

    /// Local path of `name`, downloading it into the cache when needed.
    fn get(&self, name: &str) -> Result<PathBuf> {
        match self {
            ModelSource::Local(dir) => {
                let path = dir.join(name);
                if !path.is_file() {
                    bail!("{} not found in {}", name, dir.display());
                }
                Ok(path)
            }
            ModelSource::Hub { repo, model_id } => repo
                .get(name)
                .with_context(|| format!("Failed to fetch {} from {}", name, model_id)),
        }
    }
}

/// Weight files chosen for the requested quantization.
enum WeightFiles {
    Safetensors { config: PathBuf, shards: Vec<PathBuf> },
    Gguf(PathBuf),
}

/// Builds a [`ModelBundle`] from resolved settings.
pub struct ModelLoader<'a> {
    settings: &'a Settings,
    device: ComputeDevice,
}

impl<'a> ModelLoader<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self {
            settings,
            device: gpu::select_device(),
        }
    }

    /// Use a specific device instead of auto-detection.
    pub fn with_device(mut self, device: ComputeDevice) -> Self {
        self.device = device;
        self
    }

    /// Load tokenizer, weights and the optional adapter.
    ///
    /// Failures loading the base model carry the model identifier, profile
    /// and quantization mode. Adapter problems are only reported through the
    /// bundle's [`AdapterStatus`].
    pub fn load(self) -> crate::Result<ModelBundle> {
        let settings = self.settings;

        std::fs::create_dir_all(&settings.model_cache).map_err(|e| AdvisorError::Io {
            path: settings.model_cache.clone(),
            source: e,
        })?;

        tracing::info!(
            base_model = %settings.base_model,
            profile = %settings.profile,
            quantization = %settings.quantization,
            device = %self.device.kind,
            "loading base model"
        );

        let (runtime, adapter) = self.load_runtime().map_err(|e| AdvisorError::ModelLoad {
            model: settings.base_model.clone(),
            profile: settings.profile,
            quantization: settings.quantization,
            source: e.into(),
        })?;

        tracing::info!(
            base_model = %settings.base_model,
            device = %runtime.device().kind,
            adapter = ?adapter,
            "model ready"
        );

        Ok(ModelBundle::new(runtime, adapter))
    }

    fn load_runtime(&self) -> Result<(ModelRuntime, AdapterStatus)> {
        let source = ModelSource::open(self.settings)?;
        let files = source.list()?;

        let tokenizer_path = source.get(TOKENIZER_FILE)?;
        let weights = match self.settings.quantization {
            Quantization::None => resolve_safetensors(&source, &files)?,
            Quantization::FourBit => WeightFiles::Gguf(source.get(&pick_gguf(&files)?)?),
        };

        let adapter_source = adapter::locate_adapter(&self.settings.adapter_path);

        match weights {
            WeightFiles::Safetensors { config, shards } => {
                self.load_safetensors(&tokenizer_path, &config, &shards, adapter_source)
            }
            WeightFiles::Gguf(path) => {
                let runtime = self.load_gguf(&tokenizer_path, &path)?;
                let status = match adapter_source {
                    AdapterSource::NotConfigured => AdapterStatus::NotConfigured,
                    AdapterSource::Missing(path) => AdapterStatus::Missing { path },
                    AdapterSource::Found { path, .. } => adapter::adapter_failed(
                        path,
                        "LoRA merging needs full-precision weights; the base model is GGUF-quantized"
                            .to_string(),
                    ),
                };
                Ok((runtime, status))
            }
        }
    }

    fn load_safetensors(
        &self,
        tokenizer_path: &Path,
        config_path: &Path,
        shards: &[PathBuf],
        adapter_source: AdapterSource,
    ) -> Result<(ModelRuntime, AdapterStatus)> {
        let raw = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let llama_config: LlamaConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Unsupported model config {}", config_path.display()))?;
        let config = llama_config.into_config(false);

        let device = &self.device;
        let (vb, status) = match adapter_source {
            AdapterSource::Found { path, files } => {
                // Merging needs the weights in memory rather than mmaped.
                let mut weights = WeightMap::new();
                for shard in shards {
                    let tensors = candle_core::safetensors::load(shard, &Device::Cpu)
                        .with_context(|| format!("Failed to read {}", shard.display()))?;
                    weights.extend(tensors);
                }
                let (weights, status) = adapter::merge_adapter(path, &files, weights);
                (
                    VarBuilder::from_tensors(weights, device.dtype, &device.device),
                    status,
                )
            }
            other => {
                let status = match other {
                    AdapterSource::Missing(path) => AdapterStatus::Missing { path },
                    _ => AdapterStatus::NotConfigured,
                };
                // SAFETY: the shards are not modified while mapped.
                let vb = unsafe {
                    VarBuilder::from_mmaped_safetensors(shards, device.dtype, &device.device)?
                };
                (vb, status)
            }
        };

        let model = build_llama(vb, &config)?;

        let tokenizer = PromptTokenizer::from_file(tokenizer_path, config.max_position_embeddings)?;
        let mut eos_token_ids = match &config.eos_token_id {
            Some(LlamaEosToks::Single(id)) => vec![*id],
            Some(LlamaEosToks::Multiple(ids)) => ids.clone(),
            None => Vec::new(),
        };
        if eos_token_ids.is_empty() {
            eos_token_ids = tokenizer.eos_token_ids();
        }

        let runtime = ModelRuntime::new(
            Backbone::Llama { model, config },
            tokenizer,
            self.device.clone(),
            eos_token_ids,
        );
        Ok((runtime, status))
    }

    fn load_gguf(&self, tokenizer_path: &Path, path: &Path) -> Result<ModelRuntime> {
        let mut file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let content = candle_core::quantized::gguf_file::Content::read(&mut file)
            .map_err(|e| anyhow!("Failed to read GGUF content from {}: {}", path.display(), e))?;

        let context_length = content
            .metadata
            .get("llama.context_length")
            .and_then(|v| v.to_u32().ok())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_CONTEXT_LENGTH);
        let gguf_eos = content
            .metadata
            .get("tokenizer.ggml.eos_token_id")
            .and_then(|v| v.to_u32().ok());

        let model = QuantizedLlama::from_gguf(content, &mut file, &self.device.device)
            .context("Failed to build quantized Llama weights")?;

        let tokenizer = PromptTokenizer::from_file(tokenizer_path, context_length)?;
        let eos_token_ids = match gguf_eos {
            Some(id) => vec![id],
            None => tokenizer.eos_token_ids(),
        };

        Ok(ModelRuntime::new(
            Backbone::Quantized(Mutex::new(model)),
            tokenizer,
            self.device.clone(),
            eos_token_ids,
        ))
    }
}

/// `Llama::load` unwraps per-layer lookups, so a checkpoint missing a layer
/// tensor panics. Report that as an ordinary load error.
fn build_llama(vb: VarBuilder, config: &Config) -> Result<Llama> {
    match panic::catch_unwind(AssertUnwindSafe(|| Llama::load(vb, config))) {
        Ok(model) => model.context("Failed to build Llama weights"),
        Err(payload) => bail!(
            "Failed to build Llama weights: {}",
            panic_message(payload.as_ref())
        ),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "weight construction panicked".to_string()
    }
}

fn resolve_safetensors(source: &ModelSource, files: &[String]) -> Result<WeightFiles> {
    let config = source.get(CONFIG_FILE)?;

    let shards = if files.iter().any(|f| f == SAFETENSORS_INDEX_FILE) {
        let index_path = source.get(SAFETENSORS_INDEX_FILE)?;
        let raw = std::fs::read_to_string(&index_path)
            .with_context(|| format!("Failed to read {}", index_path.display()))?;
        shard_names(&raw)?
            .iter()
            .map(|name| source.get(name))
            .collect::<Result<Vec<_>>>()?
    } else if files.iter().any(|f| f == SAFETENSORS_FILE) {
        vec![source.get(SAFETENSORS_FILE)?]
    } else {
        bail!("no safetensors weights found (expected {} or {})", SAFETENSORS_FILE, SAFETENSORS_INDEX_FILE);
    };

    Ok(WeightFiles::Safetensors { config, shards })
}

/// Unique shard file names referenced by a safetensors index.
fn shard_names(index_json: &str) -> Result<Vec<String>> {
    let index: serde_json::Value =
        serde_json::from_str(index_json).context("Invalid safetensors index")?;
    let weight_map = index
        .get("weight_map")
        .and_then(|v| v.as_object())
        .ok_or_else(|| anyhow!("safetensors index has no weight_map"))?;

    let names: BTreeSet<String> = weight_map
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    if names.is_empty() {
        bail!("safetensors index lists no shards");
    }
    Ok(names.into_iter().collect())
}

/// First `.gguf` file, preferring 4-bit (`q4`) variants.
fn pick_gguf(files: &[String]) -> Result<String> {
    let mut gguf: Vec<&String> = files
        .iter()
        .filter(|f| f.to_lowercase().ends_with(".gguf"))
        .collect();
    gguf.sort();

    gguf.iter()
        .find(|f| f.to_lowercase().contains("q4"))
        .or_else(|| gguf.first())
        .map(|f| f.to_string())
        .ok_or_else(|| {
            anyhow!("no GGUF weights in the repository; 4-bit loading needs a .gguf file")
        })
}
