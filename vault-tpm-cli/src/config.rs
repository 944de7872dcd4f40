//! Operator configuration file
//!
//! ```toml
//! [tpm]
//! device_path = "/dev/tpmrm0"
//! backend = "device"
//! key_template = "ecc"
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

use crate::logging::{LogConfig, LogFormat};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use vault_tpm::{TpmBackend, TpmConfig};

/// Whole configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub tpm: TpmConfig,
    pub logging: LogConfig,
}

/// Command-line values that override the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub device: Option<String>,
    pub backend: Option<TpmBackend>,
    pub template: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
}

impl CliConfig {
    /// Parse a configuration document
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid configuration")
    }

    /// Load `path`, or defaults when no file is given
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                Self::from_toml(&text).with_context(|| format!("in {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply command-line overrides and validate the result
    pub fn apply(mut self, overrides: Overrides) -> Result<Self> {
        if let Some(device) = overrides.device {
            self.tpm.device_path = device;
        }
        if let Some(backend) = overrides.backend {
            self.tpm.backend = backend;
        }
        if let Some(template) = overrides.template {
            self.tpm.key_template = template;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
        if let Some(format) = overrides.log_format {
            self.logging.format = format;
        }

        self.tpm.validate()?;
        Ok(self)
    }
}
