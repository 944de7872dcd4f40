//! Software TPM for testing without hardware
//!
//! Implements the subset of TPM 2.0 behaviour the seal engine depends on:
//! policy digests are extended the way a real TPM extends them, primary keys
//! are derived deterministically from a device seed and the template, and
//! sealed private areas are AES-256-GCM ciphertexts bound to their public
//! area. Session and object slots are bounded so handle leaks surface as
//! `TPM_RC_SESSION_MEMORY` / `TPM_RC_OBJECT_MEMORY`, as on real hardware.

use super::{DeviceFault, PcrSelection, PolicyDigest, SealedBlob, TpmChannel, TpmCommand, TpmDevice};
use crate::error::{TpmError, TpmResult};
use crate::handle::TpmHandle;
use crate::template::KeyTemplate;
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use zeroize::Zeroizing;

const TPM_RC_VALUE: u32 = 0x084;
const TPM_RC_HANDLE: u32 = 0x08B;
const TPM_RC_AUTH_FAIL: u32 = 0x08E;
const TPM_RC_SIZE: u32 = 0x095;
const TPM_RC_POLICY_FAIL: u32 = 0x099;
const TPM_RC_INTEGRITY: u32 = 0x09F;
const TPM_RC_FAILURE: u32 = 0x101;
const TPM_RC_OBJECT_MEMORY: u32 = 0x902;
const TPM_RC_SESSION_MEMORY: u32 = 0x903;

const TPM_CC_POLICY_AUTH_VALUE: u32 = 0x0000_016B;
const TPM_ALG_SHA256: u16 = 0x000B;

/// MAX_SYM_DATA: largest payload a keyed-hash object can seal
const MAX_SEALED_DATA: usize = 128;

/// Transient object slots
const MAX_LOADED_OBJECTS: usize = 3;

const NONCE_LEN: usize = 12;
const PUBLIC_AREA_VERSION: u8 = 1;

/// Counters exposed for assertions in tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulationStats {
    /// Channels currently open
    pub open_channels: usize,
    /// Channels opened since creation
    pub channels_opened: usize,
    /// TPM2_CreatePrimary successes
    pub primaries_created: usize,
    /// TPM2_StartAuthSession successes
    pub sessions_started: usize,
    /// TPM2_FlushContext successes
    pub flushes: usize,
}

struct PolicySessionState {
    digest: [u8; 32],
    password_required: bool,
}

struct LoadedObject {
    auth_policy: Vec<u8>,
    auth_value: Zeroizing<Vec<u8>>,
    data: Zeroizing<Vec<u8>>,
}

/// Public area of a simulated sealed data object
#[derive(Debug, Serialize, Deserialize)]
struct SealedPublicArea {
    version: u8,
    object_type: String,
    name_alg: String,
    auth_policy: String,
    nonce: String,
}

struct SimState {
    seed: Zeroizing<[u8; 32]>,
    available: bool,
    max_sessions: usize,
    next_primary: u32,
    next_transient: u32,
    next_session: u32,
    primaries: HashMap<u32, KeyTemplate>,
    objects: HashMap<u32, LoadedObject>,
    sessions: HashMap<u32, PolicySessionState>,
    faults: HashSet<TpmCommand>,
    one_shot: HashSet<TpmCommand>,
    stats: SimulationStats,
}

impl SimState {
    fn check_fault(&mut self, command: TpmCommand) -> Result<(), DeviceFault> {
        if self.faults.contains(&command) || self.one_shot.remove(&command) {
            return Err(DeviceFault::new(command, "injected fault").with_code(TPM_RC_FAILURE));
        }
        Ok(())
    }

    fn storage_key(&self, template: KeyTemplate) -> Zeroizing<[u8; 32]> {
        let hk = Hkdf::<Sha256>::new(Some(b"vault-tpm-simulated-owner-seed"), self.seed.as_ref());
        let mut key = Zeroizing::new([0u8; 32]);
        // 32 bytes is always a valid HKDF-SHA256 output length
        let _ = hk.expand(template.name().as_bytes(), key.as_mut());
        key
    }

    fn parent_template(&self, command: TpmCommand, parent: TpmHandle) -> Result<KeyTemplate, DeviceFault> {
        self.primaries.get(&parent.value()).copied().ok_or_else(|| {
            DeviceFault::new(command, format!("parent handle {} is not loaded", parent))
                .with_code(TPM_RC_HANDLE)
        })
    }

    fn session_mut(
        &mut self,
        command: TpmCommand,
        session: TpmHandle,
    ) -> Result<&mut PolicySessionState, DeviceFault> {
        self.sessions.get_mut(&session.value()).ok_or_else(|| {
            DeviceFault::new(command, format!("session {} is not loaded", session))
                .with_code(TPM_RC_HANDLE)
        })
    }
}

/// In-process software TPM.
///
/// Clones share the same device state, which lets tests model several
/// processes talking to one chip.
#[derive(Clone)]
pub struct SimulatedTpm {
    path: String,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedTpm {
    /// Create a simulated device with the default session table size
    pub fn new(path: impl Into<String>) -> Self {
        Self::with_max_sessions(path, 3)
    }

    /// Create a simulated device with `max_sessions` loaded session slots
    pub fn with_max_sessions(path: impl Into<String>, max_sessions: usize) -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(seed.as_mut());

        Self {
            path: path.into(),
            state: Arc::new(Mutex::new(SimState {
                seed,
                available: true,
                max_sessions: max_sessions.max(1),
                next_primary: 0,
                next_transient: 0,
                next_session: 0,
                primaries: HashMap::new(),
                objects: HashMap::new(),
                sessions: HashMap::new(),
                faults: HashSet::new(),
                one_shot: HashSet::new(),
                stats: SimulationStats::default(),
            })),
        }
    }

    /// Simulate the device being present or absent
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Make every subsequent `command` fail until cleared
    pub fn inject_fault(&self, command: TpmCommand) {
        self.state.lock().faults.insert(command);
    }

    /// Make only the next `command` fail
    pub fn fail_next(&self, command: TpmCommand) {
        self.state.lock().one_shot.insert(command);
    }

    /// Remove all injected faults
    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.faults.clear();
        state.one_shot.clear();
    }

    pub fn stats(&self) -> SimulationStats {
        self.state.lock().stats
    }

    /// Sessions currently loaded
    pub fn loaded_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Transient objects currently loaded
    pub fn loaded_objects(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Primary keys currently resident
    pub fn primary_handles(&self) -> Vec<TpmHandle> {
        let mut handles: Vec<TpmHandle> = self
            .state
            .lock()
            .primaries
            .keys()
            .map(|h| TpmHandle::new(*h))
            .collect();
        handles.sort();
        handles
    }

    /// TPM2_Startup(CLEAR) after a reset: transient objects and sessions are
    /// lost, persistent primary keys survive.
    pub fn restart(&self) {
        let mut state = self.state.lock();
        state.objects.clear();
        state.sessions.clear();
    }
}

impl TpmDevice for SimulatedTpm {
    fn path(&self) -> &str {
        &self.path
    }

    fn open(&self) -> TpmResult<Box<dyn TpmChannel>> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(TpmError::DeviceUnavailable {
                path: self.path.clone(),
                reason: "no TPM present".to_string(),
            });
        }
        state.stats.open_channels += 1;
        state.stats.channels_opened += 1;
        drop(state);

        Ok(Box::new(SimulatedChannel {
            state: Arc::clone(&self.state),
        }))
    }
}

/// Open channel to a [`SimulatedTpm`]
struct SimulatedChannel {
    state: Arc<Mutex<SimState>>,
}

impl Drop for SimulatedChannel {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.stats.open_channels = state.stats.open_channels.saturating_sub(1);
    }
}

fn extend(digest: &[u8; 32], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(digest);
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

impl TpmChannel for SimulatedChannel {
    fn create_primary(&mut self, template: KeyTemplate) -> Result<TpmHandle, DeviceFault> {
        let mut state = self.state.lock();
        state.check_fault(TpmCommand::CreatePrimary)?;

        let handle = TpmHandle::new(0x8101_0000 + state.next_primary);
        state.next_primary += 1;
        state.primaries.insert(handle.value(), template);
        state.stats.primaries_created += 1;
        Ok(handle)
    }

    fn start_policy_session(&mut self) -> Result<TpmHandle, DeviceFault> {
        let mut state = self.state.lock();
        state.check_fault(TpmCommand::StartAuthSession)?;

        if state.sessions.len() >= state.max_sessions {
            return Err(DeviceFault::new(
                TpmCommand::StartAuthSession,
                format!("all {} session slots are in use", state.max_sessions),
            )
            .with_code(TPM_RC_SESSION_MEMORY));
        }

        let handle = TpmHandle::new(TpmHandle::POLICY_SESSION_FIRST + state.next_session);
        state.next_session = (state.next_session + 1) & 0x00FF_FFFF;
        state.sessions.insert(
            handle.value(),
            PolicySessionState {
                digest: [0u8; 32],
                password_required: false,
            },
        );
        state.stats.sessions_started += 1;
        Ok(handle)
    }

    fn policy_pcr(&mut self, session: TpmHandle, selection: &PcrSelection) -> Result<(), DeviceFault> {
        let mut state = self.state.lock();
        state.check_fault(TpmCommand::PolicyPcr)?;
        let policy = state.session_mut(TpmCommand::PolicyPcr, session)?;

        // TPML_PCR_SELECTION with a single SHA-256 bank
        let mut pcrs = Vec::with_capacity(10);
        pcrs.extend_from_slice(&1u32.to_be_bytes());
        pcrs.extend_from_slice(&TPM_ALG_SHA256.to_be_bytes());
        pcrs.push(3);
        pcrs.extend_from_slice(&selection.bitmap());

        // Simulated PCR banks are all zero
        let mut pcr_hasher = Sha256::new();
        for _ in selection.slots.iter().filter(|s| **s < 24) {
            pcr_hasher.update([0u8; 32]);
        }
        let pcr_digest: [u8; 32] = pcr_hasher.finalize().into();

        policy.digest = extend(
            &policy.digest,
            &[&TpmCommand::PolicyPcr.code().to_be_bytes(), &pcrs, &pcr_digest],
        );
        Ok(())
    }

    fn policy_password(&mut self, session: TpmHandle) -> Result<(), DeviceFault> {
        let mut state = self.state.lock();
        state.check_fault(TpmCommand::PolicyPassword)?;
        let policy = state.session_mut(TpmCommand::PolicyPassword, session)?;

        // PolicyPassword extends the same way as PolicyAuthValue
        policy.digest = extend(&policy.digest, &[&TPM_CC_POLICY_AUTH_VALUE.to_be_bytes()]);
        policy.password_required = true;
        Ok(())
    }

    fn policy_get_digest(&mut self, session: TpmHandle) -> Result<PolicyDigest, DeviceFault> {
        let mut state = self.state.lock();
        state.check_fault(TpmCommand::PolicyGetDigest)?;
        let policy = state.session_mut(TpmCommand::PolicyGetDigest, session)?;
        Ok(PolicyDigest::new(policy.digest.to_vec()))
    }

    fn create_sealed(
        &mut self,
        parent: TpmHandle,
        _parent_auth: &[u8],
        object_auth: &[u8],
        policy: &PolicyDigest,
        data: &[u8],
    ) -> Result<SealedBlob, DeviceFault> {
        let mut state = self.state.lock();
        state.check_fault(TpmCommand::Create)?;
        let template = state.parent_template(TpmCommand::Create, parent)?;

        if data.len() > MAX_SEALED_DATA || object_auth.len() > 32 {
            return Err(DeviceFault::new(
                TpmCommand::Create,
                format!(
                    "sensitive data is {} bytes, at most {} can be sealed",
                    data.len(),
                    MAX_SEALED_DATA
                ),
            )
            .with_code(TPM_RC_SIZE));
        }

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let public = SealedPublicArea {
            version: PUBLIC_AREA_VERSION,
            object_type: "keyedhash".to_string(),
            name_alg: "sha256".to_string(),
            auth_policy: hex::encode(policy.as_bytes()),
            nonce: hex::encode(nonce),
        };
        let public = serde_json::to_vec(&public)
            .map_err(|e| DeviceFault::new(TpmCommand::Create, e.to_string()))?;

        // Sensitive area: auth value length, auth value, data
        let mut sensitive = Zeroizing::new(Vec::with_capacity(1 + object_auth.len() + data.len()));
        sensitive.push(object_auth.len() as u8);
        sensitive.extend_from_slice(object_auth);
        sensitive.extend_from_slice(data);

        let key = state.storage_key(template);
        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| DeviceFault::new(TpmCommand::Create, e.to_string()))?;
        let private = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &sensitive,
                    aad: &public,
                },
            )
            .map_err(|e| DeviceFault::new(TpmCommand::Create, e.to_string()))?;

        Ok(SealedBlob { private, public })
    }

    fn load(
        &mut self,
        parent: TpmHandle,
        _parent_auth: &[u8],
        blob: &SealedBlob,
    ) -> Result<TpmHandle, DeviceFault> {
        let mut state = self.state.lock();
        state.check_fault(TpmCommand::Load)?;
        let template = state.parent_template(TpmCommand::Load, parent)?;

        if state.objects.len() >= MAX_LOADED_OBJECTS {
            return Err(DeviceFault::new(TpmCommand::Load, "no transient object slot available")
                .with_code(TPM_RC_OBJECT_MEMORY));
        }

        let public: SealedPublicArea = serde_json::from_slice(&blob.public).map_err(|e| {
            DeviceFault::new(TpmCommand::Load, format!("malformed public area: {}", e))
                .with_code(TPM_RC_VALUE)
        })?;
        let nonce = hex::decode(&public.nonce)
            .ok()
            .filter(|n| n.len() == NONCE_LEN)
            .ok_or_else(|| {
                DeviceFault::new(TpmCommand::Load, "malformed public area nonce").with_code(TPM_RC_VALUE)
            })?;
        let auth_policy = hex::decode(&public.auth_policy).map_err(|_| {
            DeviceFault::new(TpmCommand::Load, "malformed authPolicy").with_code(TPM_RC_VALUE)
        })?;

        let key = state.storage_key(template);
        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|e| DeviceFault::new(TpmCommand::Load, e.to_string()))?;
        let sensitive = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &blob.private,
                    aad: &blob.public,
                },
            )
            .map(Zeroizing::new)
            .map_err(|_| {
                DeviceFault::new(TpmCommand::Load, "private area integrity check failed")
                    .with_code(TPM_RC_INTEGRITY)
            })?;

        let auth_len = sensitive.first().copied().unwrap_or(0) as usize;
        if sensitive.len() < 1 + auth_len {
            return Err(DeviceFault::new(TpmCommand::Load, "truncated sensitive area")
                .with_code(TPM_RC_INTEGRITY));
        }

        let handle = TpmHandle::new(TpmHandle::TRANSIENT_FIRST + state.next_transient);
        state.next_transient = (state.next_transient + 1) & 0x00FF_FFFF;
        state.objects.insert(
            handle.value(),
            LoadedObject {
                auth_policy,
                auth_value: Zeroizing::new(sensitive[1..1 + auth_len].to_vec()),
                data: Zeroizing::new(sensitive[1 + auth_len..].to_vec()),
            },
        );
        Ok(handle)
    }

    fn unseal(
        &mut self,
        object: TpmHandle,
        session: TpmHandle,
        object_auth: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, DeviceFault> {
        let mut state = self.state.lock();
        state.check_fault(TpmCommand::Unseal)?;

        let loaded = state.objects.get(&object.value()).ok_or_else(|| {
            DeviceFault::new(TpmCommand::Unseal, format!("object {} is not loaded", object))
                .with_code(TPM_RC_HANDLE)
        })?;
        let policy = state.sessions.get(&session.value()).ok_or_else(|| {
            DeviceFault::new(TpmCommand::Unseal, format!("session {} is not loaded", session))
                .with_code(TPM_RC_HANDLE)
        })?;

        if policy.digest[..] != loaded.auth_policy[..] {
            return Err(DeviceFault::new(
                TpmCommand::Unseal,
                "session policy digest does not match the object authPolicy",
            )
            .with_code(TPM_RC_POLICY_FAIL));
        }

        if policy.password_required && loaded.auth_value.as_slice() != object_auth {
            return Err(DeviceFault::new(TpmCommand::Unseal, "authorization failure")
                .with_code(TPM_RC_AUTH_FAIL));
        }

        Ok(Zeroizing::new(loaded.data.to_vec()))
    }

    fn flush_context(&mut self, handle: TpmHandle) -> Result<(), DeviceFault> {
        let mut state = self.state.lock();
        state.check_fault(TpmCommand::FlushContext)?;

        let key = handle.value();
        let removed = state.sessions.remove(&key).is_some()
            || state.objects.remove(&key).is_some()
            || state.primaries.remove(&key).is_some();
        if !removed {
            return Err(DeviceFault::new(
                TpmCommand::FlushContext,
                format!("handle {} is not loaded", handle),
            )
            .with_code(TPM_RC_HANDLE));
        }

        state.stats.flushes += 1;
        Ok(())
    }

    fn loaded_session_count(&mut self) -> Result<usize, DeviceFault> {
        let mut state = self.state.lock();
        state.check_fault(TpmCommand::GetCapability)?;
        Ok(state.sessions.len())
    }

    fn is_resident(&mut self, handle: TpmHandle) -> Result<bool, DeviceFault> {
        let mut state = self.state.lock();
        state.check_fault(TpmCommand::GetCapability)?;
        let key = handle.value();
        Ok(state.primaries.contains_key(&key)
            || state.objects.contains_key(&key)
            || state.sessions.contains_key(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy_session(channel: &mut dyn TpmChannel) -> (TpmHandle, PolicyDigest) {
        let session = channel.start_policy_session().unwrap();
        channel.policy_pcr(session, &PcrSelection::empty()).unwrap();
        channel.policy_password(session).unwrap();
        let digest = channel.policy_get_digest(session).unwrap();
        (session, digest)
    }

    #[test]
    fn test_policy_digest_is_deterministic() {
        let tpm = SimulatedTpm::new("sim");
        let mut channel = tpm.open().unwrap();
        let (s1, d1) = policy_session(channel.as_mut());
        let (s2, d2) = policy_session(channel.as_mut());
        assert_ne!(s1, s2);
        assert_eq!(d1, d2);
        assert_eq!(d1.as_bytes().len(), 32);

        // A session without the password assertion has a different digest
        let s3 = channel.start_policy_session().unwrap();
        channel.policy_pcr(s3, &PcrSelection::empty()).unwrap();
        let d3 = channel.policy_get_digest(s3).unwrap();
        assert_ne!(d1, d3);
    }

    #[test]
    fn test_seal_load_unseal() {
        let tpm = SimulatedTpm::new("sim");
        let mut channel = tpm.open().unwrap();
        let primary = channel.create_primary(KeyTemplate::Ecc).unwrap();
        let (session, digest) = policy_session(channel.as_mut());

        let blob = channel
            .create_sealed(primary, b"", b"", &digest, b"top secret")
            .unwrap();
        channel.flush_context(session).unwrap();

        let object = channel.load(primary, b"", &blob).unwrap();
        let (session, _) = policy_session(channel.as_mut());
        let data = channel.unseal(object, session, b"").unwrap();
        assert_eq!(data.as_slice(), b"top secret");
    }

    #[test]
    fn test_unseal_requires_matching_policy() {
        let tpm = SimulatedTpm::new("sim");
        let mut channel = tpm.open().unwrap();
        let primary = channel.create_primary(KeyTemplate::Rsa).unwrap();
        let (_, digest) = policy_session(channel.as_mut());
        let blob = channel.create_sealed(primary, b"", b"", &digest, b"x").unwrap();
        let object = channel.load(primary, b"", &blob).unwrap();

        let bare = channel.start_policy_session().unwrap();
        let err = channel.unseal(object, bare, b"").unwrap_err();
        assert_eq!(err.code, Some(TPM_RC_POLICY_FAIL));
    }

    #[test]
    fn test_load_rejects_null_parent_and_tampering() {
        let tpm = SimulatedTpm::new("sim");
        let mut channel = tpm.open().unwrap();
        let primary = channel.create_primary(KeyTemplate::Rsa).unwrap();
        let (session, digest) = policy_session(channel.as_mut());
        let mut blob = channel.create_sealed(primary, b"", b"", &digest, b"abc").unwrap();
        channel.flush_context(session).unwrap();

        let err = channel.load(TpmHandle::NULL, b"", &blob).unwrap_err();
        assert_eq!(err.code, Some(TPM_RC_HANDLE));

        blob.private[0] ^= 0xFF;
        let err = channel.load(primary, b"", &blob).unwrap_err();
        assert_eq!(err.code, Some(TPM_RC_INTEGRITY));
    }

    #[test]
    fn test_blob_loads_under_recreated_primary_with_same_template() {
        let tpm = SimulatedTpm::new("sim");
        let mut channel = tpm.open().unwrap();
        let first = channel.create_primary(KeyTemplate::Ecc).unwrap();
        let (session, digest) = policy_session(channel.as_mut());
        let blob = channel.create_sealed(first, b"", b"", &digest, b"k").unwrap();
        channel.flush_context(session).unwrap();
        channel.flush_context(first).unwrap();

        let second = channel.create_primary(KeyTemplate::Ecc).unwrap();
        assert_ne!(first, second);
        assert!(channel.load(second, b"", &blob).is_ok());

        let rsa = channel.create_primary(KeyTemplate::Rsa).unwrap();
        assert!(channel.load(rsa, b"", &blob).is_err());
    }

    #[test]
    fn test_session_table_exhaustion() {
        let tpm = SimulatedTpm::with_max_sessions("sim", 2);
        let mut channel = tpm.open().unwrap();
        let s1 = channel.start_policy_session().unwrap();
        channel.start_policy_session().unwrap();
        let err = channel.start_policy_session().unwrap_err();
        assert_eq!(err.code, Some(TPM_RC_SESSION_MEMORY));

        channel.flush_context(s1).unwrap();
        assert!(channel.start_policy_session().is_ok());
        assert_eq!(channel.loaded_session_count().unwrap(), 2);
    }

    #[test]
    fn test_sealed_data_size_limit() {
        let tpm = SimulatedTpm::new("sim");
        let mut channel = tpm.open().unwrap();
        let primary = channel.create_primary(KeyTemplate::Rsa).unwrap();
        let (_, digest) = policy_session(channel.as_mut());
        let err = channel
            .create_sealed(primary, b"", b"", &digest, &[7u8; MAX_SEALED_DATA + 1])
            .unwrap_err();
        assert_eq!(err.code, Some(TPM_RC_SIZE));
    }

    #[test]
    fn test_availability_and_channel_accounting() {
        let tpm = SimulatedTpm::new("sim");
        {
            let _a = tpm.open().unwrap();
            let _b = tpm.open().unwrap();
            assert_eq!(tpm.stats().open_channels, 2);
        }
        assert_eq!(tpm.stats().open_channels, 0);
        assert!(tpm.is_available());

        tpm.set_available(false);
        assert!(!tpm.is_available());
        assert!(matches!(tpm.open(), Err(TpmError::DeviceUnavailable { .. })));
    }

    #[test]
    fn test_restart_keeps_primaries() {
        let tpm = SimulatedTpm::new("sim");
        let mut channel = tpm.open().unwrap();
        let primary = channel.create_primary(KeyTemplate::Rsa).unwrap();
        channel.start_policy_session().unwrap();
        drop(channel);

        tpm.restart();
        assert_eq!(tpm.loaded_sessions(), 0);
        assert_eq!(tpm.primary_handles(), vec![primary]);
    }

    #[test]
    fn test_injected_fault() {
        let tpm = SimulatedTpm::new("sim");
        tpm.inject_fault(TpmCommand::CreatePrimary);
        let mut channel = tpm.open().unwrap();
        let err = channel.create_primary(KeyTemplate::Rsa).unwrap_err();
        assert_eq!(err.command, TpmCommand::CreatePrimary);
        tpm.clear_faults();
        assert!(channel.create_primary(KeyTemplate::Rsa).is_ok());
    }

    #[test]
    fn test_fail_next_fires_once() {
        let tpm = SimulatedTpm::new("sim");
        let mut channel = tpm.open().unwrap();
        let primary = channel.create_primary(KeyTemplate::Ecc).unwrap();

        tpm.fail_next(TpmCommand::FlushContext);
        assert!(channel.flush_context(primary).is_err());
        assert!(channel.flush_context(primary).is_ok());
    }

    #[test]
    fn test_is_resident() {
        let tpm = SimulatedTpm::new("sim");
        let mut channel = tpm.open().unwrap();
        let primary = channel.create_primary(KeyTemplate::Rsa).unwrap();
        let session = channel.start_policy_session().unwrap();
        assert!(channel.is_resident(primary).unwrap());
        assert!(channel.is_resident(session).unwrap());
        assert!(!channel.is_resident(TpmHandle::new(0x8101_7777)).unwrap());

        channel.flush_context(primary).unwrap();
        assert!(!channel.is_resident(primary).unwrap());

        tpm.inject_fault(TpmCommand::GetCapability);
        assert!(channel.is_resident(session).is_err());
    }
}
