//! Service configuration.
//!
//! Values come from the process environment, then an optional `.env` file,
//! then the defaults in this module. A [`RawSettings`] still carries the
//! unresolved choices (no base model, `auto` quantization); [`RawSettings::resolve`]
//! turns it into the [`Settings`] the rest of the service works with.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AdvisorError, Result};

/// Base model used by every profile other than `prod`.
pub const DEV_BASE_MODEL: &str = "TinyLlama/TinyLlama-1.1B-Chat-v1.0";
/// Base model used by the `prod` profile.
pub const PROD_BASE_MODEL: &str = "unsloth/llama-3-8b-bnb-4bit";
/// Adapter directory expected by the `prod` profile.
pub const PROD_ADAPTER_PATH: &str = "app/network_optimizer";

pub const DEFAULT_MODEL_CACHE: &str = "./hf_models/cache";
pub const DEFAULT_MAX_NEW_TOKENS: usize = 256;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 0.9;
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_SEED: u64 = 299792458;

/// Name of the optional file holding configuration overrides.
pub const DOTENV_FILE: &str = ".env";

/// Named configuration preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    Dev,
    Prod,
}

impl Profile {
    /// Only the exact value `prod` selects the production preset. Anything
    /// other than `dev` is unrecognized and yields `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "prod" => Some(Profile::Prod),
            "dev" => Some(Profile::Dev),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Dev => "dev",
            Profile::Prod => "prod",
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quantization mode as requested, before resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantizationMode {
    Auto,
    None,
    FourBit,
}

impl FromStr for QuantizationMode {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(QuantizationMode::Auto),
            "none" => Ok(QuantizationMode::None),
            "4bit" => Ok(QuantizationMode::FourBit),
            other => Err(format!("expected one of auto, none, 4bit, got '{}'", other)),
        }
    }
}

/// Resolved quantization mode. Never `auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quantization {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "4bit")]
    FourBit,
}

impl Quantization {
    /// Pick 4-bit whenever the model identifier advertises it.
    pub fn detect(base_model: &str) -> Self {
        if base_model.to_lowercase().contains("4bit") {
            Quantization::FourBit
        } else {
            Quantization::None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Quantization::None => "none",
            Quantization::FourBit => "4bit",
        }
    }
}

impl fmt::Display for Quantization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sampling parameters handed to the generator for every request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationConfig {
    /// Upper bound on generated tokens
    pub max_new_tokens: usize,
    /// Sampling temperature
    pub temperature: f64,
    /// Nucleus sampling threshold
    pub top_p: f64,
    /// Seed for the logits processor
    pub seed: u64,
}

/// Configuration before profile defaults are applied.
#[derive(Clone)]
pub struct RawSettings {
    pub profile: Profile,
    /// `MODEL_PROFILE` as given when it named no known profile
    pub unrecognized_profile: Option<String>,
    /// `None` or empty means "use the profile default"
    pub base_model: Option<String>,
    /// `None` means "use the profile default"; `Some("")` disables the adapter
    pub adapter_path: Option<String>,
    pub model_cache: PathBuf,
    pub quantization: QuantizationMode,
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub log_level: String,
    pub hf_token: Option<String>,
    pub bind_addr: SocketAddr,
    pub seed: u64,
}

impl Default for RawSettings {
    fn default() -> Self {
        Self {
            profile: Profile::Dev,
            unrecognized_profile: None,
            base_model: None,
            adapter_path: None,
            model_cache: PathBuf::from(DEFAULT_MODEL_CACHE),
            quantization: QuantizationMode::Auto,
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            hf_token: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            seed: DEFAULT_SEED,
        }
    }
}

impl RawSettings {
    /// Defaults for the given profile with no overrides.
    pub fn for_profile(profile: Profile) -> Self {
        Self {
            profile,
            ..Default::default()
        }
    }

    /// Read the process environment layered over `.env` in the working directory.
    pub fn load() -> Result<Self> {
        Self::load_with_dotenv(Path::new(DOTENV_FILE))
    }

    /// Read the process environment layered over the given dotenv file.
    ///
    /// A missing file is fine; a malformed one is a configuration error.
    pub fn load_with_dotenv(path: &Path) -> Result<Self> {
        Self::from_layers(path, std::env::vars())
    }

    /// Layer `env` over the dotenv file at `path`; `env` wins on conflicts.
    pub fn from_layers<I>(path: &Path, env: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut vars = read_dotenv(path)?;
        vars.extend(env);
        Self::from_vars(&vars)
    }

    /// Build from a variable map, parsing every value eagerly.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();

        let requested = vars.get("MODEL_PROFILE").map(|value| value.trim());
        let profile = requested
            .and_then(Profile::parse)
            .unwrap_or(defaults.profile);
        let unrecognized_profile = requested
            .filter(|value| Profile::parse(value).is_none())
            .map(str::to_string);

        let base_model = vars
            .get("BASE_MODEL")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let hf_token = vars
            .get("HF_TOKEN")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        Ok(Self {
            profile,
            unrecognized_profile,
            base_model,
            adapter_path: vars.get("ADAPTER_PATH").map(|value| value.trim().to_string()),
            model_cache: vars
                .get("MODEL_CACHE")
                .map(PathBuf::from)
                .unwrap_or(defaults.model_cache),
            quantization: parse_var(vars, "QUANTIZATION", defaults.quantization)?,
            max_new_tokens: parse_var(vars, "MAX_NEW_TOKENS", defaults.max_new_tokens)?,
            temperature: parse_var(vars, "TEMPERATURE", defaults.temperature)?,
            top_p: parse_var(vars, "TOP_P", defaults.top_p)?,
            log_level: vars
                .get("LOG_LEVEL")
                .map(|value| value.trim().to_string())
                .unwrap_or(defaults.log_level),
            hf_token,
            bind_addr: parse_var(vars, "BIND_ADDR", defaults.bind_addr)?,
            seed: parse_var(vars, "SEED", defaults.seed)?,
        })
    }

    /// Apply profile defaults. The base model is settled before quantization
    /// because `auto` inspects it. An unrecognized profile is logged here, so
    /// call this once logging is up.
    pub fn resolve(self) -> Settings {
        if let Some(requested) = &self.unrecognized_profile {
            tracing::warn!(
                profile = %requested,
                "unknown MODEL_PROFILE, falling back to dev"
            );
        }

        let base_model = match self.base_model {
            Some(model) if !model.is_empty() => model,
            _ => match self.profile {
                Profile::Prod => PROD_BASE_MODEL.to_string(),
                Profile::Dev => DEV_BASE_MODEL.to_string(),
            },
        };

        let adapter_path = self.adapter_path.unwrap_or_else(|| match self.profile {
            Profile::Prod => PROD_ADAPTER_PATH.to_string(),
            Profile::Dev => String::new(),
        });

        let quantization = match self.quantization {
            QuantizationMode::Auto => Quantization::detect(&base_model),
            QuantizationMode::None => Quantization::None,
            QuantizationMode::FourBit => Quantization::FourBit,
        };

        Settings {
            profile: self.profile,
            base_model,
            adapter_path,
            model_cache: self.model_cache,
            quantization,
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            log_level: self.log_level,
            hf_token: self.hf_token,
            bind_addr: self.bind_addr,
            seed: self.seed,
        }
    }
}

/// Fully resolved configuration, shared read-only for the process lifetime.
#[derive(Clone, Serialize)]
pub struct Settings {
    pub profile: Profile,
    pub base_model: String,
    /// Empty when no adapter should be applied
    pub adapter_path: String,
    pub model_cache: PathBuf,
    pub quantization: Quantization,
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub log_level: String,
    #[serde(skip_serializing)]
    pub hf_token: Option<String>,
    pub bind_addr: SocketAddr,
    pub seed: u64,
}

impl Settings {
    /// Load, resolve and validate in one step. This is what the binary uses.
    pub fn from_env() -> Result<Self> {
        let settings = RawSettings::load()?.resolve();
        settings.validate()?;
        Ok(settings)
    }

    pub fn adapter_active(&self) -> bool {
        !self.adapter_path.is_empty()
    }

    pub fn generation(&self) -> GenerationConfig {
        GenerationConfig {
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            seed: self.seed,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_model.is_empty() {
            return Err(AdvisorError::configuration(
                "BASE_MODEL",
                "Base model cannot be empty",
            ));
        }

        if self.max_new_tokens == 0 {
            return Err(AdvisorError::configuration(
                "MAX_NEW_TOKENS",
                "Must be a positive integer",
            ));
        }

        if !self.temperature.is_finite() || self.temperature <= 0.0 {
            return Err(AdvisorError::configuration(
                "TEMPERATURE",
                format!("Must be a positive number, got {}", self.temperature),
            ));
        }

        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(AdvisorError::configuration(
                "TOP_P",
                format!("Must be in (0, 1], got {}", self.top_p),
            ));
        }

        Ok(())
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("profile", &self.profile)
            .field("base_model", &self.base_model)
            .field("adapter_path", &self.adapter_path)
            .field("model_cache", &self.model_cache)
            .field("quantization", &self.quantization)
            .field("max_new_tokens", &self.max_new_tokens)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("log_level", &self.log_level)
            .field("hf_token", &self.hf_token.as_ref().map(|_| "<redacted>"))
            .field("bind_addr", &self.bind_addr)
            .field("seed", &self.seed)
            .finish()
    }
}

fn read_dotenv(path: &Path) -> Result<HashMap<String, String>> {
    let iter = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter,
        Err(e) if e.not_found() => return Ok(HashMap::new()),
        Err(e) => {
            return Err(AdvisorError::configuration(
                DOTENV_FILE,
                format!("Failed to read {}: {}", path.display(), e),
            ))
        }
    };

    iter.map(|item| {
        item.map_err(|e| {
            AdvisorError::configuration(
                DOTENV_FILE,
                format!("Malformed entry in {}: {}", path.display(), e),
            )
        })
    })
    .collect()
}

fn parse_var<T>(vars: &HashMap<String, String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match vars.get(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| {
            AdvisorError::configuration(key, format!("invalid value '{}': {}", value, e))
        }),
    }
}
