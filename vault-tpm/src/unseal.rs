//! Unseal engine

use crate::blob::BlobPaths;
use crate::device::{SealedBlob, TpmChannel};
use crate::error::TpmResult;
use crate::handle::TpmHandle;
use crate::ledger::HandleLedger;
use crate::session::{build_policy_session, FlushGuard, HandleKind};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zeroize::Zeroizing;

/// On-disk state needed to unseal one path, read before the device is opened
#[derive(Debug)]
pub(crate) struct UnsealInput {
    pub output: PathBuf,
    pub parent: TpmHandle,
    pub blob: SealedBlob,
}

impl UnsealInput {
    /// Read the ledger and the blob pair for `output`.
    ///
    /// A missing ledger yields the null parent handle, which the device
    /// rejects at load time. A corrupt ledger is reported immediately.
    pub fn load(output: &Path) -> TpmResult<Self> {
        let ledger = HandleLedger::for_output(output);
        let parent = match ledger.read_record()? {
            Some(record) => record.handle,
            None => {
                warn!(
                    target: "vault::tpm",
                    "No parent handle record at {}, loading under {}",
                    ledger.path().display(),
                    TpmHandle::NULL
                );
                TpmHandle::NULL
            }
        };
        let blob = BlobPaths::for_output(output).read()?;
        Ok(Self {
            output: output.to_path_buf(),
            parent,
            blob,
        })
    }
}

/// Load, authorize and unseal over an open channel.
///
/// The loaded object and the policy session are both flushed on every path
/// out; flush failures are logged only.
pub(crate) fn unseal_with(
    channel: &mut dyn TpmChannel,
    input: &UnsealInput,
) -> TpmResult<Zeroizing<Vec<u8>>> {
    let object = channel.load(input.parent, &[], &input.blob)?;
    let mut object_guard = FlushGuard::new(channel, object, HandleKind::Object);

    let (mut session_guard, _) = build_policy_session(object_guard.channel())?;
    let session = session_guard.handle();
    let secret = session_guard.channel().unseal(object, session, &[])?;

    info!(
        target: "vault::tpm",
        "Unsealed {} bytes from {} under {}",
        secret.len(),
        input.output.display(),
        input.parent
    );
    Ok(secret)
}
