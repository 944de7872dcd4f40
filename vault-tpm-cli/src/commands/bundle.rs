//! Bundle commands - seal and unseal a vault init record

use super::{emit, read_input, CommandResult};
use std::path::Path;
use vault_tpm::{SecretHandler, SecretStore};

pub fn seal(store: &SecretStore, input: Option<&Path>, base: &Path) -> CommandResult {
    let record = read_input(input)?;
    store.seal_vault_secrets(&record, base)?;
    Ok(format!(
        "Sealed vault init record to {} ({} store)",
        base.display(),
        store.kind()
    ))
}

pub fn unseal(store: &SecretStore, base: &Path, out: Option<&Path>, root_token_only: bool) -> CommandResult {
    if root_token_only {
        let token = store.load_root_token(base)?;
        return Ok(token.as_str().to_string());
    }
    let record = store.unseal_vault_secrets(base)?;
    emit(&record, out)
}
