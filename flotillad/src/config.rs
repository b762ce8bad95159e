//! Daemon configuration: defaults, optional TOML file, validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Daemon configuration. Every field has a default so an empty file (or
/// no file at all) is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Port for the HTTP API.
    pub listen_port: u16,
    /// Buffer size of the event broadcast bus.
    pub event_buffer: usize,
    /// Convergence poll interval of the deployment executor, in ms.
    pub poll_interval_ms: u64,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_port: 8080,
            event_buffer: 256,
            poll_interval_ms: 500,
            log_level: "info".to_string(),
        }
    }
}

impl DaemonConfig {
    /// Load from an optional TOML file, falling back to defaults, and
    /// validate the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&raw)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges before anything is wired up.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_port == 0 {
            return Err(ConfigError::Invalid("listen_port must not be 0".into()));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid("event_buffer must be at least 1".into()));
        }
        if self.poll_interval_ms < 10 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be at least 10".into(),
            ));
        }
        if !matches!(
            self.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::Invalid(format!(
                "unknown log_level '{}'",
                self.log_level
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        DaemonConfig::default().validate().unwrap();
        assert_eq!(DaemonConfig::load(None).unwrap().listen_port, 8080);
    }

    #[test]
    fn parses_partial_toml() {
        let config: DaemonConfig = toml::from_str("listen_port = 9000").unwrap();
        assert_eq!(config.listen_port, 9000);
        assert_eq!(config.event_buffer, 256);
    }

    #[test]
    fn rejects_bad_values() {
        let config: DaemonConfig = toml::from_str("poll_interval_ms = 1").unwrap();
        assert!(config.validate().is_err());

        let config: DaemonConfig = toml::from_str("log_level = \"loud\"").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = DaemonConfig::load(Some(Path::new("/nonexistent/flotilla.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
