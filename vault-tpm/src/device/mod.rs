//! TPM device channel abstraction
//!
//! A [`TpmDevice`] names one configured device path and hands out short-lived
//! [`TpmChannel`]s. A channel is opened per engine operation and closed when it
//! is dropped, so every exit path (including `?` early returns) releases it.
//!
//! Two backends are provided:
//!
//! - [`SimulatedTpm`] (`simulation` feature): in-process software TPM
//! - [`EsapiDevice`] (`tpm2` feature): hardware TPM or swtpm through `tss-esapi`

use crate::config::{TpmBackend, TpmConfig};
use crate::error::TpmResult;
use crate::handle::TpmHandle;
use crate::template::KeyTemplate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use zeroize::Zeroizing;

#[cfg(feature = "simulation")]
mod simulation;

#[cfg(feature = "tpm2")]
mod esapi;

#[cfg(feature = "simulation")]
pub use simulation::{SimulatedTpm, SimulationStats};

#[cfg(feature = "tpm2")]
pub use esapi::EsapiDevice;

/// TPM2 commands issued by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TpmCommand {
    CreatePrimary,
    StartAuthSession,
    PolicyPcr,
    PolicyPassword,
    PolicyGetDigest,
    Create,
    Load,
    Unseal,
    FlushContext,
    EvictControl,
    GetCapability,
}

impl TpmCommand {
    /// TPM_CC value of the command
    pub const fn code(self) -> u32 {
        match self {
            TpmCommand::EvictControl => 0x0000_0120,
            TpmCommand::CreatePrimary => 0x0000_0131,
            TpmCommand::FlushContext => 0x0000_0165,
            TpmCommand::PolicyPassword => 0x0000_018C,
            TpmCommand::PolicyPcr => 0x0000_017F,
            TpmCommand::PolicyGetDigest => 0x0000_0189,
            TpmCommand::Create => 0x0000_0153,
            TpmCommand::Load => 0x0000_0157,
            TpmCommand::Unseal => 0x0000_015E,
            TpmCommand::StartAuthSession => 0x0000_0176,
            TpmCommand::GetCapability => 0x0000_017A,
        }
    }
}

impl fmt::Display for TpmCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TpmCommand::CreatePrimary => "CreatePrimary",
            TpmCommand::StartAuthSession => "StartAuthSession",
            TpmCommand::PolicyPcr => "PolicyPCR",
            TpmCommand::PolicyPassword => "PolicyPassword",
            TpmCommand::PolicyGetDigest => "PolicyGetDigest",
            TpmCommand::Create => "Create",
            TpmCommand::Load => "Load",
            TpmCommand::Unseal => "Unseal",
            TpmCommand::FlushContext => "FlushContext",
            TpmCommand::EvictControl => "EvictControl",
            TpmCommand::GetCapability => "GetCapability",
        };
        write!(f, "TPM2_{}", name)
    }
}

/// Failure reported by the device for a single command
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{command} failed{}: {message}", rc_suffix(.code))]
pub struct DeviceFault {
    /// Command that failed
    pub command: TpmCommand,
    /// TPM response code, when the backend exposes one
    pub code: Option<u32>,
    /// Backend-specific description
    pub message: String,
}

fn rc_suffix(code: &Option<u32>) -> String {
    code.map(|rc| format!(" (rc 0x{:03x})", rc)).unwrap_or_default()
}

impl DeviceFault {
    pub fn new(command: TpmCommand, message: impl Into<String>) -> Self {
        Self {
            command,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: u32) -> Self {
        self.code = Some(code);
        self
    }
}

/// PCR selection bound into a policy (SHA-256 bank)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcrSelection {
    /// Selected PCR indices
    pub slots: Vec<u8>,
}

impl PcrSelection {
    /// No PCRs selected
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// TPMS_PCR_SELECTION bitmap (3 octets, 24 PCRs)
    pub fn bitmap(&self) -> [u8; 3] {
        let mut bitmap = [0u8; 3];
        for slot in self.slots.iter().filter(|s| **s < 24) {
            bitmap[(*slot / 8) as usize] |= 1 << (slot % 8);
        }
        bitmap
    }
}

/// Policy digest read back from a policy session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDigest(Vec<u8>);

impl PolicyDigest {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PolicyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// Private/public halves produced by TPM2_Create for a sealed data object
#[derive(Clone, PartialEq, Eq)]
pub struct SealedBlob {
    /// Device-opaque encrypted private area
    pub private: Vec<u8>,
    /// Marshalled public area
    pub public: Vec<u8>,
}

impl fmt::Debug for SealedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedBlob")
            .field("private_len", &self.private.len())
            .field("public_len", &self.public.len())
            .finish()
    }
}

/// One open connection to the TPM.
///
/// Handles returned by a channel for sessions and loaded objects are only
/// meaningful while that channel is open; primary key handles are durable.
pub trait TpmChannel {
    /// TPM2_CreatePrimary under the owner hierarchy with an empty owner auth
    fn create_primary(&mut self, template: KeyTemplate) -> Result<TpmHandle, DeviceFault>;

    /// TPM2_StartAuthSession (policy session, SHA-256, no salt, no bind)
    fn start_policy_session(&mut self) -> Result<TpmHandle, DeviceFault>;

    /// TPM2_PolicyPCR with an empty expected digest
    fn policy_pcr(&mut self, session: TpmHandle, selection: &PcrSelection) -> Result<(), DeviceFault>;

    /// TPM2_PolicyPassword
    fn policy_password(&mut self, session: TpmHandle) -> Result<(), DeviceFault>;

    /// TPM2_PolicyGetDigest
    fn policy_get_digest(&mut self, session: TpmHandle) -> Result<PolicyDigest, DeviceFault>;

    /// TPM2_Create of a keyed-hash data object holding `data`
    fn create_sealed(
        &mut self,
        parent: TpmHandle,
        parent_auth: &[u8],
        object_auth: &[u8],
        policy: &PolicyDigest,
        data: &[u8],
    ) -> Result<SealedBlob, DeviceFault>;

    /// TPM2_Load of a sealed blob pair under `parent`
    fn load(
        &mut self,
        parent: TpmHandle,
        parent_auth: &[u8],
        blob: &SealedBlob,
    ) -> Result<TpmHandle, DeviceFault>;

    /// TPM2_Unseal authorized by a policy session
    fn unseal(
        &mut self,
        object: TpmHandle,
        session: TpmHandle,
        object_auth: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, DeviceFault>;

    /// TPM2_FlushContext (or eviction, for persistent handles)
    fn flush_context(&mut self, handle: TpmHandle) -> Result<(), DeviceFault>;

    /// Number of sessions currently loaded on the device
    fn loaded_session_count(&mut self) -> Result<usize, DeviceFault>;

    /// Whether `handle` is currently held by the device (TPM2_GetCapability)
    fn is_resident(&mut self, handle: TpmHandle) -> Result<bool, DeviceFault>;
}

/// A configured TPM device
pub trait TpmDevice: Send + Sync {
    /// Configured device path
    fn path(&self) -> &str;

    /// Open a channel to the device
    fn open(&self) -> TpmResult<Box<dyn TpmChannel>>;

    /// Best-effort check: open and immediately close the device
    fn is_available(&self) -> bool {
        match self.open() {
            Ok(_channel) => true,
            Err(e) => {
                tracing::debug!(target: "vault::tpm", "TPM device availability check failed: {}", e);
                false
            }
        }
    }
}

/// Build the device selected by the configuration
pub fn open_device(config: &TpmConfig) -> TpmResult<Arc<dyn TpmDevice>> {
    match config.backend {
        TpmBackend::Simulation => {
            #[cfg(feature = "simulation")]
            {
                Ok(Arc::new(SimulatedTpm::with_max_sessions(
                    config.device_path.trim(),
                    config.max_sessions,
                )))
            }
            #[cfg(not(feature = "simulation"))]
            {
                Err(crate::error::TpmError::FeatureNotEnabled("simulation".to_string()))
            }
        }
        TpmBackend::Device => {
            #[cfg(feature = "tpm2")]
            {
                Ok(Arc::new(EsapiDevice::new(
                    config.device_path.trim(),
                    config.persistent_handle_base,
                )))
            }
            #[cfg(not(feature = "tpm2"))]
            {
                Err(crate::error::TpmError::FeatureNotEnabled("tpm2".to_string()))
            }
        }
    }
}
