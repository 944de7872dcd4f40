//! TPM engine configuration

use crate::error::{TpmError, TpmResult};
use crate::handle::TpmHandle;
use crate::template::KeyTemplate;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default hardware TPM character device
pub const DEFAULT_DEVICE_PATH: &str = "/dev/tpm0";

/// Device backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TpmBackend {
    /// In-process software TPM
    Simulation,
    /// TPM reached through the configured device path
    Device,
}

impl Default for TpmBackend {
    fn default() -> Self {
        if cfg!(feature = "tpm2") {
            TpmBackend::Device
        } else {
            TpmBackend::Simulation
        }
    }
}

/// TPM engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TpmConfig {
    /// Path of the TPM device (e.g. `/dev/tpm0`, `/dev/tpmrm0`)
    pub device_path: String,

    /// Device backend
    pub backend: TpmBackend,

    /// Primary key template preference (`rsa` or `ecc`, case-insensitive)
    pub key_template: String,

    /// Secret store used for vault unlock material (`tpm` or `plaintext`)
    pub secret_store: String,

    /// First owner persistent handle tried when persisting a primary key
    pub persistent_handle_base: u32,

    /// Loaded session slots of the simulated device
    pub max_sessions: usize,
}

impl Default for TpmConfig {
    fn default() -> Self {
        Self {
            device_path: DEFAULT_DEVICE_PATH.to_string(),
            backend: TpmBackend::default(),
            key_template: "rsa".to_string(),
            secret_store: "tpm".to_string(),
            persistent_handle_base: 0x8101_0000,
            max_sessions: 3,
        }
    }
}

impl TpmConfig {
    /// Configuration for the in-process simulated device
    pub fn simulation() -> Self {
        Self {
            device_path: "simulator".to_string(),
            backend: TpmBackend::Simulation,
            ..Default::default()
        }
    }

    /// Set the device path
    pub fn with_device_path(mut self, path: impl Into<String>) -> Self {
        self.device_path = path.into();
        self
    }

    /// Set the key template preference
    pub fn with_key_template(mut self, template: impl Into<String>) -> Self {
        self.key_template = template.into();
        self
    }

    /// Set the secret store kind
    pub fn with_secret_store(mut self, store: impl Into<String>) -> Self {
        self.secret_store = store.into();
        self
    }

    /// Resolved key template; unknown names fall back to RSA
    pub fn template(&self) -> KeyTemplate {
        KeyTemplate::resolve(Some(&self.key_template))
    }

    /// Parse a TOML document
    pub fn from_toml(text: &str) -> TpmResult<Self> {
        let config: TpmConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn load_from_file(path: &Path) -> TpmResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| TpmError::storage(path, e))?;
        Self::from_toml(&text)
    }

    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> TpmResult<()> {
        if self.device_path.trim().is_empty() {
            return Err(TpmError::Config("device_path cannot be empty".to_string()));
        }

        let base = self.persistent_handle_base;
        if !(TpmHandle::PERSISTENT_FIRST..=TpmHandle::PERSISTENT_OWNER_LAST).contains(&base) {
            return Err(TpmError::Config(format!(
                "persistent_handle_base {} is outside the owner persistent range",
                TpmHandle::new(base)
            )));
        }

        if self.max_sessions == 0 {
            return Err(TpmError::Config("max_sessions must be at least 1".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TpmConfig::default();
        assert_eq!(config.device_path, "/dev/tpm0");
        assert_eq!(config.template(), KeyTemplate::Rsa);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = TpmConfig::from_toml(
            r#"
            device_path = "/dev/tpmrm0"
            key_template = "ECC"
            backend = "simulation"
            "#,
        )
        .unwrap();
        assert_eq!(config.device_path, "/dev/tpmrm0");
        assert_eq!(config.backend, TpmBackend::Simulation);
        assert_eq!(config.template(), KeyTemplate::Ecc);
        assert_eq!(config.secret_store, "tpm");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = TpmConfig::default().with_device_path("  ");
        assert!(matches!(config.validate(), Err(TpmError::Config(_))));

        let config = TpmConfig {
            persistent_handle_base: 0x8000_0000,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = TpmConfig {
            max_sessions: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tpm.toml");
        std::fs::write(&path, "secret_store = \"plaintext\"\n").unwrap();
        let config = TpmConfig::load_from_file(&path).unwrap();
        assert_eq!(config.secret_store, "plaintext");

        let missing = TpmConfig::load_from_file(&dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(TpmError::Storage { .. })));
    }
}
