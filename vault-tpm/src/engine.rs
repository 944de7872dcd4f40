//! TPM seal/unseal engine facade
//!
//! [`TpmEngine`] owns an injected [`TpmDevice`] and runs every operation
//! under a process-wide lock keyed by the device path, so the
//! read-or-create and flush steps on a primary key never interleave.

use crate::cleanup::{self, CleanupReport};
use crate::config::TpmConfig;
use crate::device::{open_device, TpmDevice};
use crate::error::{TpmError, TpmResult};
use crate::handle::TpmHandle;
use crate::ledger::HandleLedger;
use crate::seal::{normalize_output, seal_with, SealOutcome, SealRequest};
use crate::template::KeyTemplate;
use crate::unseal::{unseal_with, UnsealInput};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use zeroize::Zeroizing;

static DEVICE_LOCKS: Lazy<Mutex<HashMap<String, Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn device_lock(path: &str) -> Arc<Mutex<()>> {
    DEVICE_LOCKS
        .lock()
        .entry(path.to_string())
        .or_default()
        .clone()
}

/// Seal/unseal engine bound to one TPM device
#[derive(Clone)]
pub struct TpmEngine {
    device: Arc<dyn TpmDevice>,
    default_template: KeyTemplate,
}

impl TpmEngine {
    /// Engine over an explicit device; requests without a template use RSA
    pub fn new(device: Arc<dyn TpmDevice>) -> Self {
        Self {
            device,
            default_template: KeyTemplate::default(),
        }
    }

    /// Engine over the device and template preference of `config`
    pub fn from_config(config: &TpmConfig) -> TpmResult<Self> {
        config.validate()?;
        let device = open_device(config)?;
        Ok(Self::new(device).with_default_template(config.template()))
    }

    /// Template used when a request carries none
    pub fn with_default_template(mut self, template: KeyTemplate) -> Self {
        self.default_template = template;
        self
    }

    pub fn device(&self) -> &Arc<dyn TpmDevice> {
        &self.device
    }

    pub fn default_template(&self) -> KeyTemplate {
        self.default_template
    }

    /// Best-effort device availability check
    pub fn is_available(&self) -> bool {
        self.device.is_available()
    }

    fn with_device_lock<T>(&self, op: impl FnOnce() -> TpmResult<T>) -> TpmResult<T> {
        let lock = device_lock(self.device.path());
        let _guard = lock.lock();
        op()
    }

    /// Seal `request.secret()` to `<output>.prv` / `<output>.pub`.
    ///
    /// Input is validated before the device is opened.
    pub fn seal(&self, request: &SealRequest) -> TpmResult<SealOutcome> {
        let output = request.validate()?;
        debug!(target: "vault::tpm", "{}", request);

        self.with_device_lock(|| {
            let mut channel = self.device.open()?;
            seal_with(channel.as_mut(), request, &output, self.default_template)
        })
    }

    /// `Seal(secretBytes, outputPath)` under the default parent policy
    pub fn seal_bytes(&self, secret: &[u8], output: impl AsRef<Path>) -> TpmResult<()> {
        self.seal(&SealRequest::new(secret.to_vec(), output)).map(|_| ())
    }

    /// Recover the bytes sealed at `output`
    pub fn unseal(&self, output: impl AsRef<Path>) -> TpmResult<Zeroizing<Vec<u8>>> {
        let output = normalize_output(output.as_ref())?;

        self.with_device_lock(|| {
            let input = UnsealInput::load(&output)?;
            let mut channel = self.device.open()?;
            unseal_with(channel.as_mut(), &input)
        })
    }

    /// Flush the primary keys recorded for `outputs` and delete their
    /// ledgers and blob pairs.
    ///
    /// The device is only opened when some ledger exists.
    pub fn cleanup<I, P>(&self, outputs: I) -> TpmResult<CleanupReport>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let outputs = cleanup::to_owned_paths(outputs)
            .iter()
            .map(|p| normalize_output(p))
            .collect::<TpmResult<Vec<_>>>()?;

        self.with_device_lock(|| {
            if cleanup::needs_device(&outputs) {
                let mut channel = self.device.open()?;
                return cleanup::run_cleanup(channel.as_mut(), &outputs);
            }
            let mut report = CleanupReport::default();
            cleanup::remove_blobs(&outputs, &mut report)?;
            cleanup::log_report(&report, &outputs);
            Ok(report)
        })
    }

    /// Flush the primary key recorded in `dir` and remove the ledger.
    ///
    /// Unlike cleanup, a failed flush is returned and the ledger is kept so
    /// the operator can retry. Returns the flushed handle, if any.
    pub fn flush_parent(&self, dir: impl AsRef<Path>) -> TpmResult<Option<TpmHandle>> {
        let ledger = HandleLedger::in_dir(dir.as_ref());

        self.with_device_lock(|| {
            let record = match ledger.read_record()? {
                Some(record) => record,
                None => return Ok(None),
            };
            let mut channel = self.device.open()?;
            channel.flush_context(record.handle)?;
            ledger.remove()?;
            info!(target: "vault::tpm", "Flushed parent handle {}", record);
            Ok(Some(record.handle))
        })
    }

    /// Flush (or evict) an arbitrary handle
    pub fn flush_handle(&self, handle: TpmHandle) -> TpmResult<()> {
        if handle.is_null() {
            return Err(TpmError::Validation("cannot flush the null handle".to_string()));
        }
        self.with_device_lock(|| {
            let mut channel = self.device.open()?;
            channel.flush_context(handle)?;
            info!(target: "vault::tpm", "Flushed handle {}", handle);
            Ok(())
        })
    }

    /// Sessions currently loaded on the device
    pub fn loaded_session_count(&self) -> TpmResult<usize> {
        self.with_device_lock(|| {
            let mut channel = self.device.open()?;
            Ok(channel.loaded_session_count()?)
        })
    }
}

impl fmt::Debug for TpmEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TpmEngine")
            .field("device", &self.device.path())
            .field("default_template", &self.default_template)
            .finish()
    }
}

#[cfg(all(test, feature = "simulation"))]
mod tests {
    use super::*;
    use crate::device::SimulatedTpm;

    #[test]
    fn test_device_lock_is_shared_per_path() {
        let a = device_lock("/dev/tpm-lock-test");
        let b = device_lock("/dev/tpm-lock-test");
        let c = device_lock("/dev/tpm-lock-other");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_from_config() {
        let config = TpmConfig::simulation().with_key_template("ecc");
        let engine = TpmEngine::from_config(&config).unwrap();
        assert_eq!(engine.default_template(), KeyTemplate::Ecc);
        assert!(engine.is_available());
        assert_eq!(engine.device().path(), "simulator");
    }

    #[test]
    fn test_flush_handle_rejects_null() {
        let engine = TpmEngine::new(Arc::new(SimulatedTpm::new("sim-null")));
        assert!(matches!(
            engine.flush_handle(TpmHandle::NULL),
            Err(TpmError::Validation(_))
        ));
    }

    #[test]
    fn test_seal_unseal() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("unseal_key");
        let tpm = SimulatedTpm::new("sim-engine");
        let engine = TpmEngine::new(Arc::new(tpm.clone()));

        engine.seal_bytes(b"s3cr3t", &output).unwrap();
        assert_eq!(engine.unseal(&output).unwrap().as_slice(), b"s3cr3t");
        assert_eq!(engine.loaded_session_count().unwrap(), 0);
        assert_eq!(tpm.loaded_objects(), 0);
        assert_eq!(tpm.stats().open_channels, 0);
    }
}
