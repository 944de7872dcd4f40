//! Hardware TPM access through `tss-esapi`
//!
//! ESAPI works with ESYS_TR resource handles rather than TPM handles, so the
//! channel hands out its own handle values for sessions and loaded objects
//! and keeps the mapping for as long as it is open. Primary keys are made
//! persistent with TPM2_EvictControl so the handle recorded in the ledger is
//! still valid in a later process.

use super::{DeviceFault, PcrSelection, PolicyDigest, SealedBlob, TpmChannel, TpmCommand, TpmDevice};
use crate::error::{TpmError, TpmResult};
use crate::handle::TpmHandle;
use crate::template::KeyTemplate;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, warn};
use tss_esapi::{
    attributes::ObjectAttributesBuilder,
    constants::{session_type::SessionType, CapabilityType},
    handles::{KeyHandle, ObjectHandle, PersistentTpmHandle, SessionHandle},
    interface_types::{
        algorithm::{HashingAlgorithm, PublicAlgorithm},
        ecc::EccCurve,
        key_bits::RsaKeyBits,
        resource_handles::{Hierarchy, Provision},
        session_handles::{AuthSession, PolicySession},
    },
    structures::{
        Auth, CapabilityData, Digest, EccPoint, EccScheme, KeyDerivationFunctionScheme,
        KeyedHashScheme, PcrSelectionList, PcrSelectionListBuilder, PcrSlot, Private, Public,
        PublicBuilder, PublicEccParameters, PublicKeyRsa, PublicKeyedHashParameters,
        PublicRsaParameters, RsaExponent, RsaScheme, SensitiveData, SymmetricDefinitionObject,
    },
    tcti_ldr::{DeviceConfig, TctiNameConf},
    traits::{Marshall, UnMarshall},
    Context,
};
use zeroize::Zeroizing;

/// TPM_HT_LOADED_SESSION range start
const LOADED_SESSION_FIRST: u32 = 0x0200_0000;

/// Upper bound on handles requested per capability query
const MAX_CAP_HANDLES: u32 = 254;

/// Persistent slots searched for a free handle
const PERSISTENT_SEARCH_SPAN: u32 = 64;

fn fault(command: TpmCommand, err: impl std::fmt::Display) -> DeviceFault {
    DeviceFault::new(command, err.to_string())
}

/// TPM reached through a TCTI device path (`/dev/tpmrm0`) or a full TCTI
/// name-conf string (`swtpm:host=localhost,port=2321`)
#[derive(Debug, Clone)]
pub struct EsapiDevice {
    path: String,
    persistent_base: u32,
}

impl EsapiDevice {
    pub fn new(path: impl Into<String>, persistent_base: u32) -> Self {
        Self {
            path: path.into(),
            persistent_base,
        }
    }

    fn tcti(&self) -> Result<TctiNameConf, String> {
        if self.path.contains(':') {
            TctiNameConf::from_str(&self.path).map_err(|e| e.to_string())
        } else {
            DeviceConfig::from_str(&self.path)
                .map(TctiNameConf::Device)
                .map_err(|e| e.to_string())
        }
    }
}

impl TpmDevice for EsapiDevice {
    fn path(&self) -> &str {
        &self.path
    }

    fn open(&self) -> TpmResult<Box<dyn TpmChannel>> {
        let unavailable = |reason: String| TpmError::DeviceUnavailable {
            path: self.path.clone(),
            reason,
        };
        let tcti = self.tcti().map_err(unavailable)?;
        let context = Context::new(tcti).map_err(|e| unavailable(e.to_string()))?;
        debug!(target: "vault::tpm", "Opened TPM device {}", self.path);

        Ok(Box::new(EsapiChannel {
            context,
            persistent_base: self.persistent_base,
            next_id: 0,
            sessions: HashMap::new(),
            objects: HashMap::new(),
        }))
    }
}

struct EsapiChannel {
    context: Context,
    persistent_base: u32,
    next_id: u32,
    sessions: HashMap<u32, AuthSession>,
    objects: HashMap<u32, ObjectHandle>,
}

fn primary_template(template: KeyTemplate) -> tss_esapi::Result<Public> {
    let attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_no_da(true)
        .with_restricted(true)
        .with_decrypt(true)
        .build()?;

    let builder = PublicBuilder::new()
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(attributes);

    match template {
        KeyTemplate::Rsa => builder
            .with_public_algorithm(PublicAlgorithm::Rsa)
            .with_rsa_parameters(PublicRsaParameters::new(
                SymmetricDefinitionObject::AES_128_CFB,
                RsaScheme::Null,
                RsaKeyBits::Rsa2048,
                RsaExponent::default(),
            ))
            .with_rsa_unique_identifier(PublicKeyRsa::new_empty_with_size(RsaKeyBits::Rsa2048))
            .build(),
        KeyTemplate::Ecc => builder
            .with_public_algorithm(PublicAlgorithm::Ecc)
            .with_ecc_parameters(PublicEccParameters::new(
                SymmetricDefinitionObject::AES_128_CFB,
                EccScheme::Null,
                EccCurve::NistP256,
                KeyDerivationFunctionScheme::Null,
            ))
            .with_ecc_unique_identifier(EccPoint::default())
            .build(),
    }
}

fn pcr_slot(index: u8) -> Option<PcrSlot> {
    let slot = match index {
        0 => PcrSlot::Slot0,
        1 => PcrSlot::Slot1,
        2 => PcrSlot::Slot2,
        3 => PcrSlot::Slot3,
        4 => PcrSlot::Slot4,
        5 => PcrSlot::Slot5,
        6 => PcrSlot::Slot6,
        7 => PcrSlot::Slot7,
        8 => PcrSlot::Slot8,
        9 => PcrSlot::Slot9,
        10 => PcrSlot::Slot10,
        11 => PcrSlot::Slot11,
        12 => PcrSlot::Slot12,
        13 => PcrSlot::Slot13,
        14 => PcrSlot::Slot14,
        15 => PcrSlot::Slot15,
        16 => PcrSlot::Slot16,
        17 => PcrSlot::Slot17,
        18 => PcrSlot::Slot18,
        19 => PcrSlot::Slot19,
        20 => PcrSlot::Slot20,
        21 => PcrSlot::Slot21,
        22 => PcrSlot::Slot22,
        23 => PcrSlot::Slot23,
        _ => return None,
    };
    Some(slot)
}

fn pcr_selection_list(selection: &PcrSelection) -> tss_esapi::Result<PcrSelectionList> {
    let slots: Vec<PcrSlot> = selection.slots.iter().filter_map(|s| pcr_slot(*s)).collect();
    PcrSelectionListBuilder::new()
        .with_selection(HashingAlgorithm::Sha256, &slots)
        .build()
}

impl EsapiChannel {
    fn allocate(&mut self, base: u32) -> TpmHandle {
        self.next_id = (self.next_id + 1) & 0x00FF_FFFF;
        TpmHandle::new(base + self.next_id)
    }

    fn policy_session(&self, command: TpmCommand, session: TpmHandle) -> Result<PolicySession, DeviceFault> {
        let auth = self
            .sessions
            .get(&session.value())
            .copied()
            .ok_or_else(|| fault(command, format!("session {} is not open on this channel", session)))?;
        PolicySession::try_from(auth).map_err(|e| fault(command, e))
    }

    fn persistent_object(&mut self, command: TpmCommand, handle: TpmHandle) -> Result<ObjectHandle, DeviceFault> {
        if !handle.is_persistent() {
            return Err(fault(
                command,
                format!("parent handle {} is not a persistent handle", handle),
            ));
        }
        let persistent = PersistentTpmHandle::new(handle.value()).map_err(|e| fault(command, e))?;
        self.context
            .tr_from_tpm_public(tss_esapi::handles::TpmHandle::Persistent(persistent))
            .map_err(|e| fault(command, e))
    }

    fn handles_in_range(&mut self, first: u32) -> Result<Vec<u32>, DeviceFault> {
        let (data, _) = self
            .context
            .get_capability(CapabilityType::Handles, first, MAX_CAP_HANDLES)
            .map_err(|e| fault(TpmCommand::GetCapability, e))?;
        match data {
            CapabilityData::Handles(list) => Ok(list
                .into_inner()
                .into_iter()
                .map(u32::from)
                .filter(|h| h >> 24 == first >> 24)
                .collect()),
            _ => Err(fault(TpmCommand::GetCapability, "unexpected capability data")),
        }
    }

    fn free_persistent_handle(&mut self) -> Result<u32, DeviceFault> {
        let used = self.handles_in_range(self.persistent_base)?;
        (self.persistent_base..self.persistent_base.saturating_add(PERSISTENT_SEARCH_SPAN))
            .find(|candidate| !used.contains(candidate))
            .ok_or_else(|| {
                fault(
                    TpmCommand::EvictControl,
                    format!(
                        "no free persistent handle from {}",
                        TpmHandle::new(self.persistent_base)
                    ),
                )
            })
    }

    fn evict(&mut self, handle: TpmHandle) -> Result<(), DeviceFault> {
        let object = self.persistent_object(TpmCommand::EvictControl, handle)?;
        let persistent =
            PersistentTpmHandle::new(handle.value()).map_err(|e| fault(TpmCommand::EvictControl, e))?;
        self.context
            .execute_with_nullauth_session(|ctx| {
                ctx.evict_control(Provision::Owner, object, persistent.into())
            })
            .map(|_| ())
            .map_err(|e: tss_esapi::Error| fault(TpmCommand::EvictControl, e))
    }
}

impl TpmChannel for EsapiChannel {
    fn create_primary(&mut self, template: KeyTemplate) -> Result<TpmHandle, DeviceFault> {
        let public = primary_template(template).map_err(|e| fault(TpmCommand::CreatePrimary, e))?;
        let created = self
            .context
            .execute_with_nullauth_session(|ctx| {
                ctx.create_primary(Hierarchy::Owner, public, None, None, None, None)
            })
            .map_err(|e: tss_esapi::Error| fault(TpmCommand::CreatePrimary, e))?;
        let transient: ObjectHandle = created.key_handle.into();

        let persisted = self.free_persistent_handle().and_then(|value| {
            let persistent =
                PersistentTpmHandle::new(value).map_err(|e| fault(TpmCommand::EvictControl, e))?;
            self.context
                .execute_with_nullauth_session(|ctx| {
                    ctx.evict_control(Provision::Owner, transient, persistent.into())
                })
                .map_err(|e: tss_esapi::Error| fault(TpmCommand::EvictControl, e))?;
            Ok(TpmHandle::new(value))
        });

        if let Err(e) = self.context.flush_context(transient) {
            warn!(target: "vault::tpm", "Failed to flush transient primary key: {}", e);
        }
        persisted
    }

    fn start_policy_session(&mut self) -> Result<TpmHandle, DeviceFault> {
        let session = self
            .context
            .start_auth_session(
                None,
                None,
                None,
                SessionType::Policy,
                SymmetricDefinitionObject::AES_128_CFB.into(),
                HashingAlgorithm::Sha256,
            )
            .map_err(|e| fault(TpmCommand::StartAuthSession, e))?
            .ok_or_else(|| fault(TpmCommand::StartAuthSession, "no session handle returned"))?;

        let handle = self.allocate(TpmHandle::POLICY_SESSION_FIRST);
        self.sessions.insert(handle.value(), session);
        Ok(handle)
    }

    fn policy_pcr(&mut self, session: TpmHandle, selection: &PcrSelection) -> Result<(), DeviceFault> {
        let policy = self.policy_session(TpmCommand::PolicyPcr, session)?;
        let pcrs = pcr_selection_list(selection).map_err(|e| fault(TpmCommand::PolicyPcr, e))?;
        self.context
            .policy_pcr(policy, Digest::default(), pcrs)
            .map_err(|e| fault(TpmCommand::PolicyPcr, e))
    }

    fn policy_password(&mut self, session: TpmHandle) -> Result<(), DeviceFault> {
        let policy = self.policy_session(TpmCommand::PolicyPassword, session)?;
        self.context
            .policy_password(policy)
            .map_err(|e| fault(TpmCommand::PolicyPassword, e))
    }

    fn policy_get_digest(&mut self, session: TpmHandle) -> Result<PolicyDigest, DeviceFault> {
        let policy = self.policy_session(TpmCommand::PolicyGetDigest, session)?;
        let digest = self
            .context
            .policy_get_digest(policy)
            .map_err(|e| fault(TpmCommand::PolicyGetDigest, e))?;
        Ok(PolicyDigest::new(digest.value().to_vec()))
    }

    fn create_sealed(
        &mut self,
        parent: TpmHandle,
        parent_auth: &[u8],
        object_auth: &[u8],
        policy: &PolicyDigest,
        data: &[u8],
    ) -> Result<SealedBlob, DeviceFault> {
        let command = TpmCommand::Create;
        let parent_object = self.persistent_object(command, parent)?;
        let parent_key = KeyHandle::from(parent_object);

        let attributes = ObjectAttributesBuilder::new()
            .with_fixed_tpm(true)
            .with_fixed_parent(true)
            .build()
            .map_err(|e| fault(command, e))?;
        let auth_policy = Digest::try_from(policy.as_bytes().to_vec()).map_err(|e| fault(command, e))?;
        let public = PublicBuilder::new()
            .with_public_algorithm(PublicAlgorithm::KeyedHash)
            .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
            .with_object_attributes(attributes)
            .with_auth_policy(auth_policy)
            .with_keyed_hash_parameters(PublicKeyedHashParameters::new(KeyedHashScheme::Null))
            .with_keyed_hash_unique_identifier(Digest::default())
            .build()
            .map_err(|e| fault(command, e))?;

        let sensitive = SensitiveData::try_from(data.to_vec()).map_err(|e| fault(command, e))?;
        let object_auth = Auth::try_from(object_auth.to_vec()).map_err(|e| fault(command, e))?;
        let parent_auth = Auth::try_from(parent_auth.to_vec()).map_err(|e| fault(command, e))?;
        self.context
            .tr_set_auth(parent_object, parent_auth)
            .map_err(|e| fault(command, e))?;

        let created = self
            .context
            .execute_with_nullauth_session(|ctx| {
                ctx.create(parent_key, public, Some(object_auth), Some(sensitive), None, None)
            })
            .map_err(|e: tss_esapi::Error| fault(command, e))?;

        let public = created.out_public.marshall().map_err(|e| fault(command, e))?;
        Ok(SealedBlob {
            private: created.out_private.value().to_vec(),
            public,
        })
    }

    fn load(
        &mut self,
        parent: TpmHandle,
        parent_auth: &[u8],
        blob: &SealedBlob,
    ) -> Result<TpmHandle, DeviceFault> {
        let command = TpmCommand::Load;
        let parent_object = self.persistent_object(command, parent)?;
        let private = Private::try_from(blob.private.clone()).map_err(|e| fault(command, e))?;
        let public = Public::unmarshall(&blob.public).map_err(|e| fault(command, e))?;
        let parent_auth = Auth::try_from(parent_auth.to_vec()).map_err(|e| fault(command, e))?;
        self.context
            .tr_set_auth(parent_object, parent_auth)
            .map_err(|e| fault(command, e))?;

        let loaded = self
            .context
            .execute_with_nullauth_session(|ctx| ctx.load(KeyHandle::from(parent_object), private, public))
            .map_err(|e: tss_esapi::Error| fault(command, e))?;

        let handle = self.allocate(TpmHandle::TRANSIENT_FIRST);
        self.objects.insert(handle.value(), loaded.into());
        Ok(handle)
    }

    fn unseal(
        &mut self,
        object: TpmHandle,
        session: TpmHandle,
        object_auth: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, DeviceFault> {
        let command = TpmCommand::Unseal;
        let loaded = self
            .objects
            .get(&object.value())
            .copied()
            .ok_or_else(|| fault(command, format!("object {} is not loaded on this channel", object)))?;
        let policy = self.policy_session(command, session)?;
        let object_auth = Auth::try_from(object_auth.to_vec()).map_err(|e| fault(command, e))?;
        self.context
            .tr_set_auth(loaded, object_auth)
            .map_err(|e| fault(command, e))?;

        let data = self
            .context
            .execute_with_session(Some(AuthSession::from(policy)), |ctx| ctx.unseal(loaded))
            .map_err(|e| fault(command, e))?;
        Ok(Zeroizing::new(data.value().to_vec()))
    }

    fn flush_context(&mut self, handle: TpmHandle) -> Result<(), DeviceFault> {
        let command = TpmCommand::FlushContext;
        if let Some(session) = self.sessions.remove(&handle.value()) {
            return self
                .context
                .flush_context(SessionHandle::from(session).into())
                .map_err(|e| fault(command, e));
        }
        if let Some(object) = self.objects.remove(&handle.value()) {
            return self.context.flush_context(object).map_err(|e| fault(command, e));
        }
        if handle.is_persistent() {
            return self.evict(handle);
        }
        Err(fault(command, format!("handle {} is not known to this channel", handle)))
    }

    fn loaded_session_count(&mut self) -> Result<usize, DeviceFault> {
        Ok(self.handles_in_range(LOADED_SESSION_FIRST)?.len())
    }

    fn is_resident(&mut self, handle: TpmHandle) -> Result<bool, DeviceFault> {
        let key = handle.value();
        if self.sessions.contains_key(&key) || self.objects.contains_key(&key) {
            return Ok(true);
        }
        if !handle.is_persistent() {
            return Ok(false);
        }
        Ok(self.handles_in_range(key)?.contains(&key))
    }
}

impl Drop for EsapiChannel {
    fn drop(&mut self) {
        let leftover: Vec<u32> = self.sessions.keys().chain(self.objects.keys()).copied().collect();
        for handle in leftover {
            let handle = TpmHandle::new(handle);
            if let Err(e) = self.flush_context(handle) {
                warn!(target: "vault::tpm", "Failed to flush {} on close: {}", handle, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_build() {
        assert!(primary_template(KeyTemplate::Rsa).is_ok());
        assert!(primary_template(KeyTemplate::Ecc).is_ok());
    }

    #[test]
    fn test_pcr_slots() {
        assert!(pcr_slot(23).is_some());
        assert!(pcr_slot(24).is_none());
        assert!(pcr_selection_list(&PcrSelection::empty()).is_ok());
    }

    #[test]
    fn test_missing_device_is_unavailable() {
        let device = EsapiDevice::new("/dev/does-not-exist-tpm", 0x8101_0000);
        assert!(matches!(
            device.open(),
            Err(TpmError::DeviceUnavailable { .. })
        ));
        assert!(!device.is_available());
    }
}
