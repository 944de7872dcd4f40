//! Flush command - releases a recorded primary key or an explicit handle

use super::CommandResult;
use anyhow::bail;
use std::path::Path;
use vault_tpm::{TpmEngine, TpmHandle};

pub fn execute(engine: &TpmEngine, dir: Option<&Path>, handle: Option<&str>) -> CommandResult {
    if let Some(text) = handle {
        let Some(handle) = TpmHandle::parse(text) else {
            bail!("invalid handle '{}'", text);
        };
        engine.flush_handle(handle)?;
        return Ok(format!("Flushed {}", handle));
    }

    let dir = dir.unwrap_or_else(|| Path::new("."));
    match engine.flush_parent(dir)? {
        Some(handle) => Ok(format!("Flushed parent {} recorded in {}", handle, dir.display())),
        None => Ok(format!("No parent handle recorded in {}", dir.display())),
    }
}

#[cfg(all(test, feature = "simulation"))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vault_tpm::SimulatedTpm;

    #[test]
    fn test_flush_recorded_parent() {
        let dir = tempfile::tempdir().unwrap();
        let tpm = SimulatedTpm::new("sim-cli-flush");
        let engine = TpmEngine::new(Arc::new(tpm.clone()));
        engine.seal_bytes(b"x", dir.path().join("sealed")).unwrap();

        let message = execute(&engine, Some(dir.path()), None).unwrap();
        assert!(message.starts_with("Flushed parent 0x81"), "{}", message);
        assert!(tpm.primary_handles().is_empty());

        let message = execute(&engine, Some(dir.path()), None).unwrap();
        assert!(message.starts_with("No parent handle"), "{}", message);
    }

    #[test]
    fn test_flush_explicit_handle() {
        let engine = TpmEngine::new(Arc::new(SimulatedTpm::new("sim-cli-flush-handle")));
        assert!(execute(&engine, None, Some("not-a-handle")).is_err());
        assert!(execute(&engine, None, Some("0x0")).is_err());
        assert!(execute(&engine, None, Some("0x81010005")).is_err());
    }
}
