use std::error::Error as StdError;
use std::path::PathBuf;

use crate::config::{Profile, Quantization};

pub type Result<T> = std::result::Result<T, AdvisorError>;

type BoxError = Box<dyn StdError + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum AdvisorError {
    #[error("Configuration error for {parameter}: {message}")]
    Configuration {
        parameter: String,
        message: String,
    },

    #[error(
        "Failed to load base model '{model}'. Profile={profile}, Quantization={quantization}. Original error: {source}"
    )]
    ModelLoad {
        model: String,
        profile: Profile,
        quantization: Quantization,
        #[source]
        source: BoxError,
    },

    #[error("Adapter error at '{}': {message}", path.display())]
    Adapter {
        path: PathBuf,
        message: String,
    },

    #[error("Inference error: {message}")]
    Inference {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("I/O error at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AdvisorError {
    pub(crate) fn configuration(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        AdvisorError::Configuration {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    pub(crate) fn inference<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        AdvisorError::Inference {
            message: error.to_string(),
            source: Some(Box::new(error)),
        }
    }
}

impl From<candle_core::Error> for AdvisorError {
    fn from(error: candle_core::Error) -> Self {
        AdvisorError::inference(error)
    }
}
