//! LoRA adapter discovery and merging.
//!
//! Adapters are folded into the base weights before the model is built, so
//! the runtime never sees a separate adapter path. Every problem here is
//! reported through [`AdapterStatus`]; none of them abort startup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{AdvisorError, Result};

/// Weight tensors keyed by their checkpoint name.
pub type WeightMap = HashMap<String, Tensor>;

/// Prefix every adapter weight file carries.
pub const ADAPTER_FILE_PREFIX: &str = "adapter_model";
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// Prefix PEFT puts in front of the wrapped model's parameter names.
const PEFT_KEY_PREFIX: &str = "base_model.model.";

/// What happened to the configured adapter during loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AdapterStatus {
    /// No adapter path configured
    NotConfigured,
    /// Adapter weights merged into the base model
    Applied { path: PathBuf },
    /// Directory absent or without `adapter_model*` files
    Missing { path: PathBuf },
    /// Adapter files found but merging them failed
    Failed { path: PathBuf, reason: String },
}

impl AdapterStatus {
    pub fn is_applied(&self) -> bool {
        matches!(self, AdapterStatus::Applied { .. })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct LoraConfig {
    r: usize,
    lora_alpha: f64,
    #[serde(default)]
    use_rslora: bool,
    #[serde(default)]
    fan_in_fan_out: bool,
}

impl LoraConfig {
    fn scale(&self) -> f64 {
        if self.use_rslora {
            self.lora_alpha / (self.r as f64).sqrt()
        } else {
            self.lora_alpha / self.r as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoraPart {
    A,
    B,
}

/// Files in `dir` whose name starts with `adapter_model`, sorted by name.
///
/// A missing or unreadable directory yields no files.
pub fn find_adapter_files(dir: &Path) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with(ADAPTER_FILE_PREFIX)
        })
        .map(|entry| entry.path())
        .collect();
    files.sort();
    files
}

/// Where the configured adapter stands before any weights are touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterSource {
    NotConfigured,
    Missing(PathBuf),
    Found { path: PathBuf, files: Vec<PathBuf> },
}

/// Check the adapter directory. A missing or empty directory logs a warning.
pub fn locate_adapter(adapter_path: &str) -> AdapterSource {
    if adapter_path.is_empty() {
        return AdapterSource::NotConfigured;
    }

    let path = PathBuf::from(adapter_path);
    let files = find_adapter_files(&path);
    if files.is_empty() {
        tracing::warn!(
            adapter_path = %path.display(),
            "adapter path missing adapter_model files, continuing without LoRA"
        );
        return AdapterSource::Missing(path);
    }

    AdapterSource::Found { path, files }
}

/// Fold the adapter in `files` into `weights`, best effort.
///
/// The returned map is either fully merged or exactly the input.
pub fn merge_adapter(
    path: PathBuf,
    files: &[PathBuf],
    weights: WeightMap,
) -> (WeightMap, AdapterStatus) {
    tracing::info!(adapter_path = %path.display(), files = files.len(), "merging LoRA adapter");
    match compute_merge(&path, files, &weights) {
        Ok(updates) => {
            let merged = updates.len();
            let mut weights = weights;
            weights.extend(updates);
            tracing::info!(adapter_path = %path.display(), merged, "LoRA adapter applied");
            (weights, AdapterStatus::Applied { path })
        }
        Err(e) => {
            let reason = e.to_string();
            (weights, adapter_failed(path, reason))
        }
    }
}

/// Record an adapter that was found but could not be used.
pub fn adapter_failed(path: PathBuf, reason: String) -> AdapterStatus {
    tracing::error!(
        adapter_path = %path.display(),
        error = %reason,
        "failed loading adapter, continuing with base model"
    );
    AdapterStatus::Failed { path, reason }
}

/// Compute merged replacements for every base weight the adapter touches.
fn compute_merge(dir: &Path, files: &[PathBuf], weights: &WeightMap) -> Result<WeightMap> {
    let config = read_config(dir)?;
    if config.r == 0 {
        return Err(adapter_error(dir, "adapter_config.json has r = 0"));
    }
    let scale = config.scale();

    let adapter = read_adapter_tensors(dir, files)?;

    let mut pairs: HashMap<String, (Option<Tensor>, Option<Tensor>)> = HashMap::new();
    for (key, tensor) in adapter {
        if let Some((base_key, part)) = base_weight_key(&key) {
            let entry = pairs.entry(base_key).or_default();
            match part {
                LoraPart::A => entry.0 = Some(tensor),
                LoraPart::B => entry.1 = Some(tensor),
            }
        }
    }

    if pairs.is_empty() {
        return Err(adapter_error(dir, "adapter contains no LoRA weights"));
    }

    let mut updates = WeightMap::with_capacity(pairs.len());
    for (base_key, pair) in pairs {
        let (lora_a, lora_b) = match pair {
            (Some(a), Some(b)) => (a, b),
            _ => {
                return Err(adapter_error(
                    dir,
                    format!("incomplete lora_A/lora_B pair for {}", base_key),
                ))
            }
        };

        let base = weights.get(&base_key).ok_or_else(|| {
            adapter_error(dir, format!("base model has no weight named {}", base_key))
        })?;

        let merged = merge_pair(base, &lora_a, &lora_b, scale, config.fan_in_fan_out)
            .map_err(|e| adapter_error(dir, format!("merging {}: {}", base_key, e)))?;
        updates.insert(base_key, merged);
    }

    Ok(updates)
}

/// `base + scale * (B @ A)`, computed in f32 and cast back to the base dtype.
fn merge_pair(
    base: &Tensor,
    lora_a: &Tensor,
    lora_b: &Tensor,
    scale: f64,
    fan_in_fan_out: bool,
) -> candle_core::Result<Tensor> {
    let lora_a = lora_a.to_device(base.device())?.to_dtype(DType::F32)?;
    let lora_b = lora_b.to_device(base.device())?.to_dtype(DType::F32)?;

    let mut delta = lora_b.matmul(&lora_a)?;
    if fan_in_fan_out {
        delta = delta.t()?.contiguous()?;
    }

    if delta.dims() != base.dims() {
        candle_core::bail!(
            "delta shape {:?} does not match base shape {:?}",
            delta.dims(),
            base.dims()
        );
    }

    let merged = (base.to_dtype(DType::F32)? + delta.affine(scale, 0.0)?)?;
    merged.to_dtype(base.dtype())
}

/// Map a PEFT tensor name to the base weight it modifies.
fn base_weight_key(key: &str) -> Option<(String, LoraPart)> {
    let key = key.strip_prefix(PEFT_KEY_PREFIX).unwrap_or(key);

    for (marker, part) in [(".lora_A", LoraPart::A), (".lora_B", LoraPart::B)] {
        if let Some(idx) = key.rfind(marker) {
            let rest = &key[idx + marker.len()..];
            if rest.is_empty() || rest.starts_with('.') {
                return Some((format!("{}.weight", &key[..idx]), part));
            }
        }
    }

    None
}

fn read_config(dir: &Path) -> Result<LoraConfig> {
    let path = dir.join(ADAPTER_CONFIG_FILE);
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| adapter_error(dir, format!("cannot read {}: {}", path.display(), e)))?;
    serde_json::from_str(&raw)
        .map_err(|e| adapter_error(dir, format!("invalid {}: {}", ADAPTER_CONFIG_FILE, e)))
}

/// Prefer safetensors; fall back to a PyTorch pickle.
fn read_adapter_tensors(dir: &Path, files: &[PathBuf]) -> Result<Vec<(String, Tensor)>> {
    let has_extension = |path: &PathBuf, ext: &str| {
        path.extension()
            .map(|e| e.eq_ignore_ascii_case(ext))
            .unwrap_or(false)
    };

    if let Some(file) = files.iter().find(|f| has_extension(f, "safetensors")) {
        let tensors = candle_core::safetensors::load(file, &Device::Cpu).map_err(|e| {
            adapter_error(dir, format!("cannot read {}: {}", file.display(), e))
        })?;
        return Ok(tensors.into_iter().collect());
    }

    if let Some(file) = files
        .iter()
        .find(|f| has_extension(f, "bin") || has_extension(f, "pt") || has_extension(f, "pth"))
    {
        return candle_core::pickle::read_all(file).map_err(|e| {
            adapter_error(dir, format!("cannot read {}: {}", file.display(), e))
        });
    }

    Err(adapter_error(
        dir,
        "no adapter_model file in a supported format (safetensors, bin)",
    ))
}

fn adapter_error(dir: &Path, message: impl Into<String>) -> AdvisorError {
    AdvisorError::Adapter {
        path: dir.to_path_buf(),
        message: message.into(),
    }
}
