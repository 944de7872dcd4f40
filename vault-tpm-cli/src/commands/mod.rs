//! CLI command implementations
//!
//! Each submodule implements one subcommand on top of the `vault-tpm`
//! engine. Commands return the text printed on success.

pub mod bundle;
pub mod flush;
pub mod seal;
pub mod sessions;
pub mod status;
pub mod unseal;

use anyhow::{Context, Result};
use std::io::{Read, Write};
use std::path::Path;
use zeroize::Zeroizing;

/// Common result type for CLI commands
pub type CommandResult = Result<String>;

/// Read secret material from `input`, or stdin when absent
pub(crate) fn read_input(input: Option<&Path>) -> Result<Zeroizing<Vec<u8>>> {
    match input {
        Some(path) => std::fs::read(path)
            .map(Zeroizing::new)
            .with_context(|| format!("failed to read {}", path.display())),
        None => {
            let mut buf = Zeroizing::new(Vec::new());
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("failed to read stdin")?;
            Ok(buf)
        }
    }
}

/// Write recovered material to `out` with owner-only permissions
pub(crate) fn write_output(out: &Path, bytes: &[u8]) -> Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(out)
        .with_context(|| format!("failed to create {}", out.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("failed to write {}", out.display()))
}

/// Render recovered material for stdout, or write it to `out`
pub(crate) fn emit(bytes: &[u8], out: Option<&Path>) -> CommandResult {
    match out {
        Some(out) => {
            write_output(out, bytes)?;
            Ok(format!("Wrote {} bytes to {}", bytes.len(), out.display()))
        }
        None => String::from_utf8(bytes.to_vec())
            .context("unsealed data is not UTF-8 text; use --out to write it to a file"),
    }
}
