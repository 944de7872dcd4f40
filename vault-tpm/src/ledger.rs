//! Parent handle ledger
//!
//! Every directory that holds sealed output carries one `parentHndl` sidecar
//! recording the primary key all blobs in that directory were sealed under:
//!
//! ```text
//! 0x81010000,RSA
//! ```

use crate::error::{TpmError, TpmResult};
use crate::fs::{parent_dir, remove_if_exists, write_atomic};
use crate::handle::TpmHandle;
use crate::template::KeyTemplate;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of the ledger sidecar
pub const PARENT_HANDLE_FILE: &str = "parentHndl";

/// One ledger record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentHandleRecord {
    pub handle: TpmHandle,
    pub template: KeyTemplate,
}

impl ParentHandleRecord {
    pub fn new(handle: TpmHandle, template: KeyTemplate) -> Self {
        Self { handle, template }
    }

    /// Parse `"<hex-handle>,<template-name>"`.
    ///
    /// A missing or unknown template name is tolerated since the template is
    /// only kept for diagnostics.
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut fields = text.trim().splitn(2, ',');
        let handle_field = fields.next().unwrap_or_default().trim();
        let handle = TpmHandle::parse(handle_field)
            .filter(|h| !h.is_null())
            .ok_or_else(|| format!("'{}' is not a handle", handle_field))?;
        let template = fields
            .next()
            .and_then(KeyTemplate::from_name)
            .unwrap_or_default();
        Ok(Self { handle, template })
    }
}

impl fmt::Display for ParentHandleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.handle, self.template.name())
    }
}

/// Ledger for one output directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleLedger {
    path: PathBuf,
}

impl HandleLedger {
    /// Ledger in the directory of `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(PARENT_HANDLE_FILE),
        }
    }

    /// Ledger shared by every sealed path in the directory of `output`
    pub fn for_output(output: &Path) -> Self {
        Self::in_dir(&parent_dir(output))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Replace the record atomically
    pub fn write(&self, record: &ParentHandleRecord) -> TpmResult<()> {
        write_atomic(&self.path, record.to_string().as_bytes())?;
        debug!(target: "vault::tpm", "Recorded parent handle {} in {}", record, self.path.display());
        Ok(())
    }

    /// Strict read: `None` when absent, `LedgerCorrupt` when unparsable
    pub fn read_record(&self) -> TpmResult<Option<ParentHandleRecord>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                return Err(self.corrupt("record is not valid UTF-8"))
            }
            Err(e) => return Err(TpmError::storage(&self.path, e)),
        };
        ParentHandleRecord::parse(&text)
            .map(Some)
            .map_err(|reason| self.corrupt(reason))
    }

    /// Lenient read: the null handle when the record is absent or corrupt
    pub fn read_handle(&self) -> TpmHandle {
        match self.read_record() {
            Ok(Some(record)) => record.handle,
            Ok(None) => TpmHandle::NULL,
            Err(e) => {
                debug!(target: "vault::tpm", "Ignoring unreadable ledger: {}", e);
                TpmHandle::NULL
            }
        }
    }

    /// Delete the record; returns whether one existed
    pub fn remove(&self) -> TpmResult<bool> {
        remove_if_exists(&self.path)
    }

    fn corrupt(&self, reason: impl Into<String>) -> TpmError {
        TpmError::LedgerCorrupt {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_record_format() {
        let record = ParentHandleRecord::new(TpmHandle::new(0x8101_0002), KeyTemplate::Ecc);
        assert_eq!(record.to_string(), "0x81010002,ECC");
        assert_eq!(ParentHandleRecord::parse("0x81010002,ECC"), Ok(record));
    }

    #[test]
    fn test_parse_tolerates_template_field() {
        let record = ParentHandleRecord::parse("0x81000001\n").unwrap();
        assert_eq!(record.template, KeyTemplate::Rsa);
        let record = ParentHandleRecord::parse("0x81000001,RSA Template").unwrap();
        assert_eq!(record.handle, TpmHandle::new(0x8100_0001));
        assert_eq!(record.template, KeyTemplate::Rsa);
    }

    #[test]
    fn test_display_form_template_is_kept() {
        let record = ParentHandleRecord::parse("0x81000001,ECC Template").unwrap();
        assert_eq!(record.template, KeyTemplate::Ecc);
    }

    #[test]
    fn test_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = HandleLedger::for_output(&dir.path().join("unseal"));
        assert_eq!(ledger.path(), dir.path().join(PARENT_HANDLE_FILE));
        assert!(!ledger.exists());
        assert_eq!(ledger.read_record().unwrap(), None);
        assert_eq!(ledger.read_handle(), TpmHandle::NULL);

        let record = ParentHandleRecord::new(TpmHandle::new(0x8101_0000), KeyTemplate::Rsa);
        ledger.write(&record).unwrap();
        assert!(ledger.exists());
        assert_eq!(
            std::fs::read_to_string(ledger.path()).unwrap(),
            "0x81010000,RSA"
        );
        assert_eq!(ledger.read_handle(), record.handle);

        assert!(ledger.remove().unwrap());
        assert!(!ledger.exists());
    }

    #[test]
    fn test_garbage_reads_as_null() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = HandleLedger::in_dir(dir.path());
        std::fs::write(ledger.path(), "not-a-handle,RSA").unwrap();

        assert_eq!(ledger.read_handle(), TpmHandle::NULL);
        assert!(matches!(
            ledger.read_record(),
            Err(TpmError::LedgerCorrupt { .. })
        ));

        std::fs::write(ledger.path(), [0xFFu8, 0xFE, 0x00]).unwrap();
        assert_eq!(ledger.read_handle(), TpmHandle::NULL);
    }

    proptest! {
        #[test]
        fn prop_read_never_panics(content in ".*") {
            let dir = tempfile::tempdir().unwrap();
            let ledger = HandleLedger::in_dir(dir.path());
            std::fs::write(ledger.path(), &content).unwrap();
            let _ = ledger.read_handle();
        }
    }
}
