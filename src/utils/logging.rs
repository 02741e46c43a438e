use std::sync::Once;

use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

use crate::config::DEFAULT_LOG_LEVEL;
use crate::error::{AdvisorError, Result};

static INIT: Once = Once::new();

/// Logging configuration options
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default level directive, overridden by `RUST_LOG` when set
    pub level: String,
    /// Whether to include source code locations
    pub source_location: bool,
    /// Whether to log span close events with timings
    pub log_spans: bool,
    /// Whether to colorize output
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            source_location: false,
            log_spans: false,
            ansi: true,
        }
    }
}

impl LogConfig {
    /// Default options with the given `LOG_LEVEL` value.
    pub fn with_level(level: &str) -> Self {
        Self {
            level: level.to_string(),
            ..Default::default()
        }
    }
}

/// Initialize the global subscriber. Only the first call has an effect.
pub fn setup_logging(config: LogConfig) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = setup_logging_internal(config);
    });

    result
}

fn setup_logging_internal(config: LogConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => build_filter(&config.level)?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(config.ansi)
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_span_events(if config.log_spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        })
        .try_init()
        .map_err(|e| {
            AdvisorError::configuration("LOG_LEVEL", format!("failed to set global subscriber: {}", e))
        })
}

/// Parse a level name such as `INFO` or a full directive such as
/// `network_advisor=debug,tower_http=info`.
fn build_filter(level: &str) -> Result<EnvFilter> {
    let level = level.trim();
    let directive = if level.is_empty() {
        DEFAULT_LOG_LEVEL.to_string()
    } else {
        level.to_ascii_lowercase()
    };

    EnvFilter::try_new(&directive)
        .map_err(|e| AdvisorError::configuration("LOG_LEVEL", format!("'{}': {}", level, e)))
}
