//! Configuration management for Pacer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{PacerError, Result};
use crate::limiter::{Policy, PolicySpec};

/// Prefix for environment overrides, e.g. `PACER__LOGGING__LEVEL=debug`.
const ENV_PREFIX: &str = "PACER";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PacerConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Named wrapper policies
    #[serde(default)]
    pub policies: BTreeMap<String, PolicySpec>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, in `tracing_subscriber::EnvFilter` syntax
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl PacerConfig {
    /// Load configuration from a YAML file, then apply `PACER__*` environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PacerError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("config file not found: {}", path.display()),
            )));
        }

        let config = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| PacerError::Config(e.to_string()))?;

        let config: PacerConfig = config
            .try_deserialize()
            .map_err(|e| PacerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PacerConfig = serde_yaml::from_str(yaml)
            .map_err(|e| PacerError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a named policy and convert it.
    pub fn policy(&self, name: &str) -> Result<Policy> {
        let spec = self
            .policies
            .get(name)
            .ok_or_else(|| PacerError::Config(format!("unknown policy: {}", name)))?;
        Policy::try_from(spec)
    }

    /// Check every named policy converts to a valid [`Policy`].
    pub fn validate(&self) -> Result<()> {
        for (name, spec) in &self.policies {
            Policy::try_from(spec).map_err(|e| {
                PacerError::Config(format!("policy '{}' is invalid: {}", name, e))
            })?;
        }
        Ok(())
    }
}
