//! Sessions command - counts loaded sessions on the device

use super::CommandResult;
use vault_tpm::TpmEngine;

pub fn execute(engine: &TpmEngine) -> CommandResult {
    let count = engine.loaded_session_count()?;
    Ok(format!("{}", count))
}
