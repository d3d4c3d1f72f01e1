//! Runner configuration.
//!
//! Loaded from a TOML file, then overridden by command-line flags.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use xvm_vm::VmConfig;

/// Runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Directory of the JSON contract state
    pub state_dir: PathBuf,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Engine configuration
    pub vm: VmConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("./data/state"),
            logging: LoggingConfig::default(),
            vm: VmConfig::default(),
        }
    }
}

impl RunConfig {
    /// Load configuration from file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| {
                anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
            })?;
        let config: RunConfig = toml::from_str(&contents)
            .map_err(|e| {
                anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e)
            })?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn to_file(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .map_err(|e| {
                anyhow::anyhow!("Failed to write config file '{}': {}", path.display(), e)
            })?;
        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.vm.validate()?;

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format: {}", self.logging.format);
        }

        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log to file
    pub log_file: Option<PathBuf>,
    /// Log format (json|pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_file: None,
            format: "pretty".to_string(),
        }
    }
}
