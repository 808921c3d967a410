//! Allocator configuration
//!
//! Parsed once from `PYTORCH_NPU_ALLOC_CONF` at first use and cached
//! for the life of the process. Tests parse strings directly instead
//! of going through the environment.

use once_cell::sync::Lazy;
use thiserror::Error;

use crate::allocator::block::LARGE_BUFFER;

/// Environment variable holding comma-separated `key:value` pairs.
pub const ALLOC_CONF_ENV: &str = "PYTORCH_NPU_ALLOC_CONF";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("unrecognized allocator option: {0}")]
    UnrecognizedOption(String),
    #[error("expected {expected} for allocator option {option}, got `{value}`")]
    InvalidValue {
        option: String,
        expected: &'static str,
        value: String,
    },
    #[error("allocator option {0} is missing a value")]
    MissingValue(String),
}

/// Immutable allocator tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct AllocatorConfig {
    /// Blocks at or above this size are never split and never lent to
    /// smaller requests. `usize::MAX` means unlimited (the default).
    pub max_split_size: usize,
    /// Fraction of the memory-fraction cap above which the age-based
    /// fragmentation GC runs. Zero disables GC.
    pub garbage_collection_threshold: f64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            max_split_size: usize::MAX,
            garbage_collection_threshold: 0.0,
        }
    }
}

impl AllocatorConfig {
    /// Parse a `PYTORCH_NPU_ALLOC_CONF`-style string.
    ///
    /// Recognised keys: `max_split_size_mb` (integer, must be larger
    /// than the 20 MiB large-buffer size) and
    /// `garbage_collection_threshold` (float in (0, 1)).
    pub fn parse(conf: &str) -> Result<Self, ConfigError> {
        let mut config = AllocatorConfig::default();
        for entry in conf.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (key, value) = entry
                .split_once(':')
                .ok_or_else(|| ConfigError::MissingValue(entry.to_string()))?;
            let key = key.trim();
            let value = value.trim();
            match key {
                "max_split_size_mb" => {
                    let mb: usize = value.parse().map_err(|_| ConfigError::InvalidValue {
                        option: key.to_string(),
                        expected: "an integer number of MiB",
                        value: value.to_string(),
                    })?;
                    let min_mb = LARGE_BUFFER / (1024 * 1024);
                    if mb <= min_mb {
                        return Err(ConfigError::InvalidValue {
                            option: key.to_string(),
                            expected: "a value larger than 20",
                            value: value.to_string(),
                        });
                    }
                    let mb = mb.min(usize::MAX / (1024 * 1024));
                    config.max_split_size = mb * 1024 * 1024;
                }
                "garbage_collection_threshold" => {
                    let threshold: f64 = value.parse().map_err(|_| ConfigError::InvalidValue {
                        option: key.to_string(),
                        expected: "a float in (0, 1)",
                        value: value.to_string(),
                    })?;
                    if threshold <= 0.0 || threshold >= 1.0 {
                        return Err(ConfigError::InvalidValue {
                            option: key.to_string(),
                            expected: "a float in (0, 1)",
                            value: value.to_string(),
                        });
                    }
                    config.garbage_collection_threshold = threshold;
                }
                _ => return Err(ConfigError::UnrecognizedOption(key.to_string())),
            }
        }
        Ok(config)
    }

    /// The process-wide configuration, parsed from the environment once.
    ///
    /// An invalid value in the environment is a setup error and aborts,
    /// matching the framework's behaviour for malformed tuning knobs.
    pub fn global() -> &'static AllocatorConfig {
        static CONFIG: Lazy<AllocatorConfig> = Lazy::new(|| match std::env::var(ALLOC_CONF_ENV) {
            Ok(conf) => match AllocatorConfig::parse(&conf) {
                Ok(config) => {
                    tracing::debug!("allocator config from {}: {:?}", ALLOC_CONF_ENV, config);
                    config
                }
                Err(e) => panic!("invalid {}: {}", ALLOC_CONF_ENV, e),
            },
            Err(_) => AllocatorConfig::default(),
        });
        &CONFIG
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_yields_defaults() {
        let config = AllocatorConfig::parse("").unwrap();
        assert_eq!(config.max_split_size, usize::MAX);
        assert_eq!(config.garbage_collection_threshold, 0.0);
    }

    #[test]
    fn parses_both_options() {
        let config =
            AllocatorConfig::parse("max_split_size_mb:256,garbage_collection_threshold:0.6")
                .unwrap();
        assert_eq!(config.max_split_size, 256 * 1024 * 1024);
        assert_eq!(config.garbage_collection_threshold, 0.6);
    }

    #[test]
    fn tolerates_whitespace() {
        let config = AllocatorConfig::parse(" max_split_size_mb : 64 ").unwrap();
        assert_eq!(config.max_split_size, 64 * 1024 * 1024);
    }

    #[test]
    fn max_split_size_must_exceed_large_buffer() {
        assert!(AllocatorConfig::parse("max_split_size_mb:20").is_err());
        assert!(AllocatorConfig::parse("max_split_size_mb:21").is_ok());
    }

    #[test]
    fn gc_threshold_must_be_a_proper_fraction() {
        assert!(AllocatorConfig::parse("garbage_collection_threshold:0.0").is_err());
        assert!(AllocatorConfig::parse("garbage_collection_threshold:1.0").is_err());
        assert!(AllocatorConfig::parse("garbage_collection_threshold:0.5").is_ok());
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert!(matches!(
            AllocatorConfig::parse("roundup_power2_divisions:4"),
            Err(ConfigError::UnrecognizedOption(_))
        ));
    }

    #[test]
    fn missing_value_is_rejected() {
        assert!(matches!(
            AllocatorConfig::parse("max_split_size_mb"),
            Err(ConfigError::MissingValue(_))
        ));
    }
}
