//! Logging configuration and initialization
//!
//! Centralized logging setup using the `tracing` ecosystem, with
//! human-readable (colored) and JSON output formats, configurable via
//! environment variables or programmatically.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Standard tracing filter (e.g., "info,npuforge=trace")
//! - `NPUFORGE_LOG_LEVEL`: Simple log level (error, warn, info, debug, trace)
//! - `NPUFORGE_LOG_FORMAT`: Output format ("human" or "json")

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_LEVEL: &str = "info";
const LOG_LEVEL_ENV: &str = "NPUFORGE_LOG_LEVEL";
const LOG_FORMAT_ENV: &str = "NPUFORGE_LOG_FORMAT";

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum LoggingError {
    /// Invalid log level string provided
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    /// Invalid log format string provided
    #[error("invalid log format: {0}")]
    InvalidLogFormat(String),
}

/// Output format for log records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable output with colors
    #[default]
    Human,
    /// Newline-delimited JSON
    Json,
}

impl LogFormat {
    fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "human" | "text" => Some(LogFormat::Human),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

fn level_filter() -> Result<EnvFilter, LoggingError> {
    // RUST_LOG wins when set; otherwise the simple level variable.
    if std::env::var("RUST_LOG").is_ok() {
        return Ok(EnvFilter::from_default_env());
    }
    let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());
    match level.to_lowercase().as_str() {
        "error" | "warn" | "warning" | "info" | "debug" | "trace" => {
            Ok(EnvFilter::new(level.to_lowercase()))
        }
        _ => Err(LoggingError::InvalidLogLevel(level)),
    }
}

/// Initialize tracing from the environment. Safe to call more than
/// once; only the first call installs a subscriber.
pub fn init_logging() -> Result<(), LoggingError> {
    let format = match std::env::var(LOG_FORMAT_ENV) {
        Ok(value) => LogFormat::from_str(&value).ok_or(LoggingError::InvalidLogFormat(value))?,
        Err(_) => LogFormat::default(),
    };
    let filter = level_filter()?;

    TRACING_INITIALIZED.get_or_init(|| {
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        let installed = match format {
            LogFormat::Human => builder.try_init(),
            LogFormat::Json => builder.json().try_init(),
        };
        if installed.is_err() {
            // A subscriber from the embedding application is already
            // active; our records flow into it.
            tracing::debug!("tracing subscriber already installed");
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing() {
        assert_eq!(LogFormat::from_str("human"), Some(LogFormat::Human));
        assert_eq!(LogFormat::from_str("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::from_str("xml"), None);
    }

    #[test]
    fn init_twice_is_safe() {
        init_logging().unwrap();
        init_logging().unwrap();
    }
}
