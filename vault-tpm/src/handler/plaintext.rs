//! Unprotected on-disk secret store

use super::SecretHandler;
use crate::error::{TpmError, TpmResult};
use crate::seal::normalize_output;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::debug;
use zeroize::Zeroizing;

/// Writes the vault init record to a file as-is (owner-only on unix)
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextHandler;

impl PlainTextHandler {
    pub fn new() -> Self {
        Self
    }
}

impl SecretHandler for PlainTextHandler {
    fn seal_vault_secrets(&self, secret: &[u8], output: &Path) -> TpmResult<()> {
        let output = normalize_output(output)?;

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(&output)
            .map_err(|e| TpmError::storage(&output, e))?;
        file.write_all(secret)
            .and_then(|_| file.sync_all())
            .map_err(|e| TpmError::storage(&output, e))?;

        debug!(target: "vault::tpm", "Wrote {} bytes to {}", secret.len(), output.display());
        Ok(())
    }

    fn unseal_vault_secrets(&self, path: &Path) -> TpmResult<Zeroizing<Vec<u8>>> {
        let path = normalize_output(path)?;
        std::fs::read(&path)
            .map(Zeroizing::new)
            .map_err(|e| TpmError::storage(&path, e))
    }
}
