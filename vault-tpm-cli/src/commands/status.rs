//! Status command - device availability and the recorded parent handle

use super::CommandResult;
use std::fmt::Write;
use std::path::Path;
use vault_tpm::{HandleLedger, TpmConfig, TpmEngine, TpmError};

pub fn execute(engine: &TpmEngine, config: &TpmConfig, dir: &Path) -> CommandResult {
    let mut out = String::new();
    writeln!(out, "Device:    {}", engine.device().path())?;
    writeln!(out, "Backend:   {:?}", config.backend)?;
    writeln!(
        out,
        "Available: {}",
        if engine.is_available() { "yes" } else { "no" }
    )?;
    writeln!(out, "Template:  {}", engine.default_template())?;

    let ledger = HandleLedger::in_dir(dir);
    let parent = match ledger.read_record() {
        Ok(Some(record)) => record.to_string(),
        Ok(None) => "none".to_string(),
        Err(TpmError::LedgerCorrupt { reason, .. }) => format!("corrupt ({})", reason),
        Err(e) => return Err(e.into()),
    };
    write!(out, "Parent:    {} [{}]", parent, ledger.path().display())?;
    Ok(out)
}
