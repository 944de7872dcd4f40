//! Vault secret handlers
//!
//! The vault bootstrap seals its init record once and unseals it on every
//! start. Which store is used is decided once, from configuration.

mod plaintext;
mod tpm;

pub use plaintext::PlainTextHandler;
pub use tpm::TpmSecretHandler;

use crate::bundle::SecretBundle;
use crate::config::TpmConfig;
use crate::engine::TpmEngine;
use crate::error::TpmResult;
use std::path::Path;
use tracing::warn;
use zeroize::Zeroizing;

/// Common interface for the vault secret stores
pub trait SecretHandler: Send + Sync {
    /// Protect the vault init record (JSON) under `output`
    fn seal_vault_secrets(&self, secret: &[u8], output: &Path) -> TpmResult<()>;

    /// Recover the vault init record stored under `path`
    fn unseal_vault_secrets(&self, path: &Path) -> TpmResult<Zeroizing<Vec<u8>>>;
}

/// Configured secret store
#[derive(Debug)]
pub enum SecretStore {
    /// Sealed with the TPM
    Tpm(TpmSecretHandler),
    /// Stored as-is on disk
    PlainText(PlainTextHandler),
}

impl SecretStore {
    /// Pick the store named by `config.secret_store` (`tpm` or `plaintext`,
    /// case-insensitive). Unknown names fall back to plaintext.
    pub fn from_config(config: &TpmConfig) -> TpmResult<Self> {
        let kind = config.secret_store.trim().to_ascii_lowercase();
        match kind.as_str() {
            "tpm" => Ok(SecretStore::Tpm(TpmSecretHandler::new(TpmEngine::from_config(
                config,
            )?))),
            "plaintext" => Ok(SecretStore::PlainText(PlainTextHandler::new())),
            _ => {
                warn!(
                    target: "vault::tpm",
                    "Unknown secret store '{}' (supported: tpm, plaintext), using plaintext",
                    config.secret_store
                );
                Ok(SecretStore::PlainText(PlainTextHandler::new()))
            }
        }
    }

    /// Store name as accepted by configuration
    pub fn kind(&self) -> &'static str {
        match self {
            SecretStore::Tpm(_) => "tpm",
            SecretStore::PlainText(_) => "plaintext",
        }
    }

    fn handler(&self) -> &dyn SecretHandler {
        match self {
            SecretStore::Tpm(handler) => handler,
            SecretStore::PlainText(handler) => handler,
        }
    }

    /// Unseal the record at `path` and return only its root token
    pub fn load_root_token(&self, path: &Path) -> TpmResult<Zeroizing<String>> {
        let raw = self.unseal_vault_secrets(path)?;
        let mut bundle = SecretBundle::from_json(&raw)?;
        Ok(Zeroizing::new(std::mem::take(&mut bundle.root_token)))
    }
}

impl SecretHandler for SecretStore {
    fn seal_vault_secrets(&self, secret: &[u8], output: &Path) -> TpmResult<()> {
        self.handler().seal_vault_secrets(secret, output)
    }

    fn unseal_vault_secrets(&self, path: &Path) -> TpmResult<Zeroizing<Vec<u8>>> {
        self.handler().unseal_vault_secrets(path)
    }
}
