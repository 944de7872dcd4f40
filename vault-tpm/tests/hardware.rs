//! Hardware TPM tests
//!
//! Run against a real TPM or swtpm with
//! `VAULT_TPM_DEVICE=/dev/tpmrm0 cargo test --features tpm2 --test hardware`.
//! Every test is skipped when no device answers.

#![cfg(feature = "tpm2")]

use std::sync::Arc;
use vault_tpm::{
    EsapiDevice, HandleLedger, SealRequest, TpmDevice, TpmEngine, TpmError,
};

fn hardware_engine() -> Option<TpmEngine> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let path = std::env::var("VAULT_TPM_DEVICE").unwrap_or_else(|_| "/dev/tpmrm0".to_string());
    let device = EsapiDevice::new(path, 0x8101_0000);
    if !device.is_available() {
        eprintln!("Skipping hardware TPM test: {} not available", device.path());
        return None;
    }
    Some(TpmEngine::new(Arc::new(device)))
}

#[test]
fn test_hardware_round_trip() {
    let Some(engine) = hardware_engine() else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("unseal_key");

    let outcome = engine
        .seal(&SealRequest::new(b"hardware sealed".to_vec(), &output).with_template("ecc"))
        .unwrap();
    assert!(outcome.parent.is_persistent());

    assert_eq!(engine.unseal(&output).unwrap().as_slice(), b"hardware sealed");
    assert_eq!(engine.loaded_session_count().unwrap(), 0);

    engine.flush_parent(dir.path()).unwrap();
    assert!(!HandleLedger::in_dir(dir.path()).exists());
}

#[test]
fn test_hardware_reuse_and_cleanup() {
    let Some(engine) = hardware_engine() else {
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");

    let first = engine.seal(&SealRequest::new(b"a".to_vec(), &a)).unwrap();
    let second = engine
        .seal(&SealRequest::new(b"b".to_vec(), &b))
        .unwrap();
    assert_eq!(first.parent, second.parent);
    assert_eq!(engine.unseal(&b).unwrap().as_slice(), b"b");

    let report = engine.cleanup([&a, &b]).unwrap();
    assert_eq!(report.flushed, vec![first.parent]);

    let err = engine.unseal(&a).unwrap_err();
    assert!(matches!(err, TpmError::Storage { .. }), "got {err}");
}
