//! Removal of stale primary keys and sealed blob pairs
//!
//! Cleanup is scoped to the output paths it is given: the ledger of each
//! path's directory and the `.prv`/`.pub` pair of each path. Nothing else in
//! the directory is touched.

use crate::blob::BlobPaths;
use crate::device::TpmChannel;
use crate::error::{TpmError, TpmResult};
use crate::fs::parent_dir;
use crate::handle::TpmHandle;
use crate::ledger::HandleLedger;
use crate::template::KeyTemplate;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// What a cleanup pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Primary keys flushed from the device
    pub flushed: Vec<TpmHandle>,
    /// Primary keys whose flush failed (their ledger was removed anyway)
    pub flush_failed: Vec<TpmHandle>,
    /// Ledger files deleted
    pub ledgers_removed: usize,
    /// `.prv`/`.pub` files deleted
    pub blobs_removed: usize,
}

impl CleanupReport {
    /// True when nothing was found to clean
    pub fn is_empty(&self) -> bool {
        self.flushed.is_empty()
            && self.flush_failed.is_empty()
            && self.ledgers_removed == 0
            && self.blobs_removed == 0
    }
}

/// Distinct ledgers covering `outputs`
pub(crate) fn ledgers_for(outputs: &[PathBuf]) -> Vec<HandleLedger> {
    let mut ledgers: Vec<HandleLedger> = Vec::new();
    for output in outputs {
        let ledger = HandleLedger::for_output(output);
        if !ledgers.contains(&ledger) {
            ledgers.push(ledger);
        }
    }
    ledgers
}

/// True when some ledger covering `outputs` exists, so cleanup needs the device
pub(crate) fn needs_device(outputs: &[PathBuf]) -> bool {
    ledgers_for(outputs).iter().any(HandleLedger::exists)
}

/// Flush the recorded primary key and delete the ledger.
///
/// A failed flush or a corrupt record is logged and the ledger is removed
/// regardless, so a fresh hierarchy can always be built afterwards.
pub(crate) fn retire_ledger(
    channel: &mut dyn TpmChannel,
    ledger: &HandleLedger,
    report: &mut CleanupReport,
) -> TpmResult<()> {
    match ledger.read_record() {
        Ok(Some(record)) => match channel.flush_context(record.handle) {
            Ok(()) => {
                debug!(target: "vault::tpm", "Flushed parent handle {}", record.handle);
                report.flushed.push(record.handle);
            }
            Err(e) => {
                warn!(
                    target: "vault::tpm",
                    "Failed to flush parent handle {}: {}", record.handle, e
                );
                report.flush_failed.push(record.handle);
            }
        },
        Ok(None) => return Ok(()),
        Err(e @ TpmError::LedgerCorrupt { .. }) => {
            warn!(target: "vault::tpm", "Discarding ledger: {}", e);
        }
        Err(e) => return Err(e),
    }

    if ledger.remove()? {
        report.ledgers_removed += 1;
    }
    Ok(())
}

/// Delete the blob pairs of `outputs`
pub(crate) fn remove_blobs(outputs: &[PathBuf], report: &mut CleanupReport) -> TpmResult<()> {
    for output in outputs {
        report.blobs_removed += BlobPaths::for_output(output).remove()?;
    }
    Ok(())
}

/// Full cleanup over an open channel
pub(crate) fn run_cleanup(
    channel: &mut dyn TpmChannel,
    outputs: &[PathBuf],
) -> TpmResult<CleanupReport> {
    let mut report = CleanupReport::default();
    for ledger in ledgers_for(outputs) {
        retire_ledger(channel, &ledger, &mut report)?;
    }
    remove_blobs(outputs, &mut report)?;
    log_report(&report, outputs);
    Ok(report)
}

/// State of the primary key recorded next to an output, as found before a seal
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RecordedParent {
    /// No record, or a resident one that can seal this output
    Usable,
    /// The record was retired; a new primary key is needed
    Retired(CleanupReport),
    /// The recorded key is gone from the device. Its ledger is removed; a
    /// primary recreated from the same template unwraps the sibling blobs.
    Lost {
        template: KeyTemplate,
        report: CleanupReport,
    },
}

/// True when `output`'s directory holds a `.pub` blob half of another path
pub(crate) fn has_sibling_pairs(output: &Path) -> TpmResult<bool> {
    let own = BlobPaths::for_output(output).public;
    let dir = parent_dir(output);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(TpmError::storage(&dir, e)),
    };
    for entry in entries {
        let path = entry.map_err(|e| TpmError::storage(&dir, e))?.path();
        if path.extension().map_or(false, |ext| ext == "pub") && path.file_name() != own.file_name() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Decide whether the primary key recorded for `output`'s directory can be
/// sealed under, retiring it when it cannot.
///
/// A record is retired when it cannot be parsed, when its handle is no longer
/// resident, or when `output` itself is being re-sealed and no other blob pair
/// in the directory depends on the key.
pub(crate) fn check_recorded_parent(
    channel: &mut dyn TpmChannel,
    output: &Path,
) -> TpmResult<RecordedParent> {
    let ledger = HandleLedger::for_output(output);
    let outputs = [output.to_path_buf()];

    let record = match ledger.read_record() {
        Ok(Some(record)) => record,
        Ok(None) => return Ok(RecordedParent::Usable),
        Err(e @ TpmError::LedgerCorrupt { .. }) => {
            warn!(target: "vault::tpm", "Replacing unreadable ledger: {}", e);
            return run_cleanup(channel, &outputs).map(RecordedParent::Retired);
        }
        Err(e) => return Err(e),
    };

    let resident = match channel.is_resident(record.handle) {
        Ok(resident) => resident,
        Err(e) => {
            warn!(
                target: "vault::tpm",
                "Could not check parent handle {}, keeping it: {}", record.handle, e
            );
            true
        }
    };
    if !resident {
        warn!(
            target: "vault::tpm",
            "Parent handle {} is no longer on the device", record.handle
        );
        let mut report = CleanupReport::default();
        if ledger.remove()? {
            report.ledgers_removed += 1;
        }
        remove_blobs(&outputs, &mut report)?;
        log_report(&report, &outputs);
        return Ok(RecordedParent::Lost {
            template: record.template,
            report,
        });
    }

    if BlobPaths::for_output(output).any_exists() && !has_sibling_pairs(output)? {
        debug!(
            target: "vault::tpm",
            "Re-sealing {}, retiring parent handle {}",
            output.display(),
            record.handle
        );
        return run_cleanup(channel, &outputs).map(RecordedParent::Retired);
    }

    Ok(RecordedParent::Usable)
}

pub(crate) fn log_report(report: &CleanupReport, outputs: &[PathBuf]) {
    if report.is_empty() {
        return;
    }
    debug!(
        target: "vault::tpm",
        "Cleanup of {} path(s): flushed={} flush_failed={} ledgers={} blobs={}",
        outputs.len(),
        report.flushed.len(),
        report.flush_failed.len(),
        report.ledgers_removed,
        report.blobs_removed
    );
}

pub(crate) fn to_owned_paths<I, P>(outputs: I) -> Vec<PathBuf>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    outputs.into_iter().map(|p| p.as_ref().to_path_buf()).collect()
}
