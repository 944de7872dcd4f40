//! TPM-backed secret store

use super::SecretHandler;
use crate::bundle::{self, BundlePaths, SecretBundle};
use crate::engine::TpmEngine;
use crate::error::{TpmError, TpmResult};
use crate::seal::{normalize_output, ParentPolicy, SealRequest};
use crate::template::KeyTemplate;
use std::path::Path;
use tracing::info;
use zeroize::Zeroizing;

/// Seals the vault init record field by field.
///
/// All three fields share one primary key: the ledger and the three blob
/// pairs are cleaned once, the first field creates the primary key and the
/// other two reuse it.
///
/// Each field is a single sealed object and holds at most
/// [`MAX_FIELD_LEN`](crate::bundle::MAX_FIELD_LEN) bytes once its list is
/// joined. One hex-encoded 32-byte share already takes 64 of them, so a
/// record with several shares is rejected before the device is opened.
#[derive(Debug, Clone)]
pub struct TpmSecretHandler {
    engine: TpmEngine,
    template: KeyTemplate,
}

impl TpmSecretHandler {
    /// Handler using the engine's default template
    pub fn new(engine: TpmEngine) -> Self {
        let template = engine.default_template();
        Self { engine, template }
    }

    pub fn with_template(mut self, template: KeyTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn engine(&self) -> &TpmEngine {
        &self.engine
    }

    /// Seal `bundle` under the suffixed paths of `base`
    pub fn seal_bundle(&self, bundle: &SecretBundle, base: &Path) -> TpmResult<()> {
        let base = normalize_output(base)?;
        let fields = bundle::split(bundle)?;
        let paths = BundlePaths::for_base(&base);

        self.engine.cleanup(paths.all())?;

        let sealed = [
            (&paths.keys, &fields.keys),
            (&paths.keys_base64, &fields.keys_base64),
            (&paths.root_token, &fields.root_token),
        ];
        for (path, field) in sealed {
            let request = SealRequest::new(field.as_bytes().to_vec(), path)
                .with_template(self.template.name())
                .with_parent_policy(ParentPolicy::Reuse);
            self.engine.seal(&request)?;
        }

        info!(
            target: "vault::tpm",
            "Sealed vault secrets ({} key shares) to {}",
            bundle.keys.len(),
            base.display()
        );
        Ok(())
    }

    /// Unseal the three fields under `base` and recompose the bundle
    pub fn unseal_bundle(&self, base: &Path) -> TpmResult<SecretBundle> {
        let base = normalize_output(base)?;
        let paths = BundlePaths::for_base(&base);

        let keys = self.unseal_field(&paths.keys)?;
        let keys_base64 = self.unseal_field(&paths.keys_base64)?;
        let root_token = self.unseal_field(&paths.root_token)?;

        Ok(bundle::join(&keys, &keys_base64, &root_token))
    }

    fn unseal_field(&self, path: &Path) -> TpmResult<Zeroizing<String>> {
        let bytes = self.engine.unseal(path)?;
        String::from_utf8(bytes.to_vec())
            .map(Zeroizing::new)
            .map_err(|_| {
                TpmError::Bundle(format!("{} did not unseal to UTF-8 text", path.display()))
            })
    }
}

impl SecretHandler for TpmSecretHandler {
    fn seal_vault_secrets(&self, secret: &[u8], output: &Path) -> TpmResult<()> {
        let bundle = SecretBundle::from_json(secret)?;
        self.seal_bundle(&bundle, output)
    }

    fn unseal_vault_secrets(&self, path: &Path) -> TpmResult<Zeroizing<Vec<u8>>> {
        self.unseal_bundle(path)?.to_json()
    }
}
