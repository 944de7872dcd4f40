//! Unseal command - recovers the bytes sealed at a path

use super::{emit, CommandResult};
use std::path::Path;
use vault_tpm::TpmEngine;

pub fn execute(engine: &TpmEngine, path: &Path, out: Option<&Path>) -> CommandResult {
    let secret = engine.unseal(path)?;
    emit(&secret, out)
}
