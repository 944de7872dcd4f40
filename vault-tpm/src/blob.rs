//! Sealed blob pair files (`<P>.prv` / `<P>.pub`)

use crate::device::SealedBlob;
use crate::error::{TpmError, TpmResult};
use crate::fs::{commit, remove_if_exists, stage, with_suffix};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Suffix of the private half
pub const PRIVATE_SUFFIX: &str = ".prv";

/// Suffix of the public half
pub const PUBLIC_SUFFIX: &str = ".pub";

/// Location of the blob pair for one sealed logical path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobPaths {
    pub private: PathBuf,
    pub public: PathBuf,
}

impl BlobPaths {
    pub fn for_output(output: &Path) -> Self {
        Self {
            private: with_suffix(output, PRIVATE_SUFFIX),
            public: with_suffix(output, PUBLIC_SUFFIX),
        }
    }

    /// True when both halves are present
    pub fn exists(&self) -> bool {
        self.private.is_file() && self.public.is_file()
    }

    /// True when either half is present as a file
    pub fn any_exists(&self) -> bool {
        self.private.is_file() || self.public.is_file()
    }

    /// Persist both halves.
    ///
    /// Both are staged before either is renamed into place. If the public
    /// half cannot be committed the private half just written is removed, so
    /// a new private area never sits next to a stale public area.
    pub fn write(&self, blob: &SealedBlob) -> TpmResult<()> {
        let private = stage(&self.private, &blob.private)?;
        let public = stage(&self.public, &blob.public)?;

        commit(private, &self.private)?;
        if let Err(e) = commit(public, &self.public) {
            if let Err(rollback) = remove_if_exists(&self.private) {
                warn!(
                    target: "vault::tpm",
                    "Failed to remove {} after a failed blob write: {}",
                    self.private.display(),
                    rollback
                );
            }
            return Err(e);
        }
        Ok(())
    }

    /// Read both halves; either one missing is a storage error
    pub fn read(&self) -> TpmResult<SealedBlob> {
        let private = std::fs::read(&self.private).map_err(|e| TpmError::storage(&self.private, e))?;
        let public = std::fs::read(&self.public).map_err(|e| TpmError::storage(&self.public, e))?;
        Ok(SealedBlob { private, public })
    }

    /// Delete whichever halves exist; returns how many were removed
    pub fn remove(&self) -> TpmResult<usize> {
        let mut removed = 0;
        for path in [&self.private, &self.public] {
            if remove_if_exists(path)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
