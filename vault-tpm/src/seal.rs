//! Seal engine

use crate::blob::BlobPaths;
use crate::cleanup::{check_recorded_parent, run_cleanup, CleanupReport, RecordedParent};
use crate::device::TpmChannel;
use crate::error::{TpmError, TpmResult};
use crate::handle::TpmHandle;
use crate::ledger::{HandleLedger, ParentHandleRecord};
use crate::session::build_policy_session;
use crate::template::KeyTemplate;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// How an existing parent handle record is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParentPolicy {
    /// Seal under the recorded primary key while it is healthy. It is
    /// replaced when the record is corrupt, when the key is no longer on the
    /// device, or when this path is re-sealed and no other blob pair in the
    /// directory was sealed under it.
    #[default]
    Auto,
    /// Flush the recorded primary key and remove the ledger and this path's
    /// blob pair before sealing, so a new primary key is created. Other blob
    /// pairs in the directory can no longer be unsealed afterwards.
    Fresh,
    /// Seal under any parsable record without checking the device
    Reuse,
}

/// One seal call
#[derive(Clone)]
pub struct SealRequest {
    secret: Zeroizing<Vec<u8>>,
    output: PathBuf,
    template: Option<String>,
    parent_policy: ParentPolicy,
}

impl SealRequest {
    pub fn new(secret: impl Into<Vec<u8>>, output: impl AsRef<Path>) -> Self {
        Self {
            secret: Zeroizing::new(secret.into()),
            output: output.as_ref().to_path_buf(),
            template: None,
            parent_policy: ParentPolicy::default(),
        }
    }

    /// Key template preference (`"rsa"` / `"ecc"`)
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn with_parent_policy(mut self, policy: ParentPolicy) -> Self {
        self.parent_policy = policy;
        self
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn template(&self) -> Option<&str> {
        self.template.as_deref()
    }

    pub fn parent_policy(&self) -> ParentPolicy {
        self.parent_policy
    }

    /// Check the request without touching the device; returns the
    /// normalized output path
    pub fn validate(&self) -> TpmResult<PathBuf> {
        if self.secret.is_empty() {
            return Err(TpmError::Validation("secret is empty".to_string()));
        }
        normalize_output(&self.output)
    }
}

impl fmt::Debug for SealRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealRequest")
            .field("secret_len", &self.secret.len())
            .field("output", &self.output)
            .field("template", &self.template)
            .field("parent_policy", &self.parent_policy)
            .finish()
    }
}

impl fmt::Display for SealRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seal {} bytes to {} ({:?} parent",
            self.secret.len(),
            self.output.display(),
            self.parent_policy
        )?;
        if let Some(template) = &self.template {
            write!(f, ", template {}", template)?;
        }
        f.write_str(")")
    }
}

/// Result of a successful seal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealOutcome {
    /// Primary key the blob was sealed under
    pub parent: TpmHandle,
    /// Template recorded for that primary key
    pub template: KeyTemplate,
    /// Whether this call created the primary key
    pub primary_created: bool,
    /// Where the blob pair was written
    pub blobs: BlobPaths,
    /// Cleanup performed first, when the recorded primary key was retired
    pub cleanup: Option<CleanupReport>,
}

/// Trim a caller-supplied output path; it must be non-empty and name a file
pub(crate) fn normalize_output(output: &Path) -> TpmResult<PathBuf> {
    let output = match output.to_str() {
        Some(text) => PathBuf::from(text.trim()),
        None => output.to_path_buf(),
    };
    if output.as_os_str().is_empty() {
        return Err(TpmError::Validation("output path is empty".to_string()));
    }
    if output.file_name().is_none() {
        return Err(TpmError::Validation(format!(
            "output path {} does not name a file",
            output.display()
        )));
    }
    Ok(output)
}

/// Return the recorded primary key or create (and record) a new one
fn ensure_primary(
    channel: &mut dyn TpmChannel,
    ledger: &HandleLedger,
    template: KeyTemplate,
) -> TpmResult<(ParentHandleRecord, bool)> {
    if let Some(record) = ledger.read_record()? {
        debug!(target: "vault::tpm", "Reusing parent handle {}", record);
        return Ok((record, false));
    }

    let handle = channel.create_primary(template).map_err(TpmError::PrimaryKey)?;
    let record = ParentHandleRecord::new(handle, template);
    if let Err(e) = ledger.write(&record) {
        // An unrecorded primary key could never be flushed again
        if let Err(flush) = channel.flush_context(handle) {
            warn!(
                target: "vault::tpm",
                "Failed to flush unrecorded primary key {}: {}", handle, flush
            );
        }
        return Err(e);
    }

    info!(target: "vault::tpm", "Created primary key {} with {}", handle, template);
    Ok((record, true))
}

/// Run a validated seal over an open channel.
///
/// Sequence: parent record check, primary key, policy session, TPM2_Create,
/// blob pair write. The session is flushed on every path out.
pub(crate) fn seal_with(
    channel: &mut dyn TpmChannel,
    request: &SealRequest,
    output: &Path,
    default_template: KeyTemplate,
) -> TpmResult<SealOutcome> {
    let mut default_template = default_template;
    let cleanup = match request.parent_policy {
        ParentPolicy::Fresh => Some(run_cleanup(channel, &[output.to_path_buf()])?),
        ParentPolicy::Reuse => None,
        ParentPolicy::Auto => match check_recorded_parent(channel, output)? {
            RecordedParent::Usable => None,
            RecordedParent::Retired(report) => Some(report),
            RecordedParent::Lost { template, report } => {
                default_template = template;
                Some(report)
            }
        },
    };

    let template = match request.template() {
        Some(name) => KeyTemplate::resolve(Some(name)),
        None => default_template,
    };

    let ledger = HandleLedger::for_output(output);
    let (record, primary_created) = ensure_primary(channel, &ledger, template)?;

    let (mut session, policy) = build_policy_session(channel)?;
    let blob = session
        .channel()
        .create_sealed(record.handle, &[], &[], &policy, request.secret())?;

    let blobs = BlobPaths::for_output(output);
    blobs.write(&blob)?;
    drop(session);

    info!(
        target: "vault::tpm",
        "Sealed {} bytes to {} under {}",
        request.secret().len(),
        output.display(),
        record.handle
    );

    Ok(SealOutcome {
        parent: record.handle,
        template: record.template,
        primary_created,
        blobs,
        cleanup,
    })
}
