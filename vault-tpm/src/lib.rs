//! # vault-tpm
//!
//! TPM 2.0 seal/unseal engine for vault unlock secrets.
//!
//! Secrets are sealed as keyed-hash objects under a primary key (SRK) in the
//! owner hierarchy. Each seal is authorized by a policy session that asserts
//! an (empty) PCR state and requires password authorization, so unsealing
//! needs the same TPM and the same policy shape.
//!
//! On-disk layout for a sealed path `P`:
//!
//! - `dir(P)/parentHndl`: `"<hex-handle>,<template>"` of the primary key
//! - `P.prv`, `P.pub`: the sealed blob pair
//!
//! ## Features
//!
//! - `simulation` (default): in-process software TPM for tests and development
//! - `tpm2`: hardware TPM (or swtpm) via `tss-esapi`
//!
//! ## Usage
//!
//! ```ignore
//! use vault_tpm::{SealRequest, TpmConfig, TpmEngine};
//!
//! let engine = TpmEngine::from_config(&TpmConfig::default())?;
//! engine.seal(&SealRequest::new(secret, "/vault/res/unseal").with_template("ecc"))?;
//! let secret = engine.unseal("/vault/res/unseal")?;
//! ```

pub mod blob;
pub mod bundle;
pub mod cleanup;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod handle;
pub mod handler;
pub mod ledger;
pub mod seal;
pub mod session;
pub mod template;
mod unseal;

mod fs;

// Re-exports
pub use blob::BlobPaths;
pub use bundle::{BundleFields, BundlePaths, SecretBundle};
pub use cleanup::CleanupReport;
pub use config::{TpmBackend, TpmConfig, DEFAULT_DEVICE_PATH};
pub use device::{
    open_device, DeviceFault, PcrSelection, PolicyDigest, SealedBlob, TpmChannel, TpmCommand,
    TpmDevice,
};
pub use engine::TpmEngine;
pub use error::{ErrorCategory, SessionStage, TpmError, TpmResult};
pub use handle::TpmHandle;
pub use handler::{PlainTextHandler, SecretHandler, SecretStore, TpmSecretHandler};
pub use ledger::{HandleLedger, ParentHandleRecord, PARENT_HANDLE_FILE};
pub use seal::{ParentPolicy, SealOutcome, SealRequest};
pub use template::KeyTemplate;

#[cfg(feature = "simulation")]
pub use device::{SimulatedTpm, SimulationStats};

#[cfg(feature = "tpm2")]
pub use device::EsapiDevice;
