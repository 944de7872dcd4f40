//! Secret store integration tests
//!
//! Seals a full vault init record through the configured store and reads it
//! back, the way the vault bootstrap does on first start and on restart.

#![cfg(feature = "simulation")]

use std::sync::Arc;
use vault_tpm::{
    BlobPaths, BundlePaths, HandleLedger, KeyTemplate, SecretBundle, SecretHandler, SecretStore, SimulatedTpm,
    TpmConfig, TpmEngine, TpmError, TpmSecretHandler,
};

const INIT_RECORD: &[u8] = br#"{
    "keys": ["3e1f9c", "a0b1c2", "77aa01"],
    "keys_base64": ["Ph+c", "oLHC", "d6oB"],
    "root_token": "s.Qf1s5zigZ4OX6akYjQXJC1jY"
}"#;

/// Configured TPM store seals and unseals the whole record
#[test]
fn test_tpm_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("resp-init.json");

    let config = TpmConfig::simulation()
        .with_secret_store("TPM")
        .with_key_template("ecc");
    let store = SecretStore::from_config(&config).unwrap();
    assert_eq!(store.kind(), "tpm");

    store.seal_vault_secrets(INIT_RECORD, &base).unwrap();

    let paths = BundlePaths::for_base(&base);
    for path in paths.all() {
        assert!(BlobPaths::for_output(path).exists(), "{} not sealed", path.display());
    }
    assert!(!base.exists(), "the record itself is never written in clear");

    let raw = store.unseal_vault_secrets(&base).unwrap();
    let expected = SecretBundle::from_json(INIT_RECORD).unwrap();
    assert_eq!(SecretBundle::from_json(&raw).unwrap(), expected);

    let token = store.load_root_token(&base).unwrap();
    assert_eq!(token.as_str(), "s.Qf1s5zigZ4OX6akYjQXJC1jY");
}

/// The three fields land next to the base path with their suffixes
#[test]
fn test_bundle_file_layout() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("resp-init.json");
    let tpm = SimulatedTpm::new("sim-store-layout");
    let handler = TpmSecretHandler::new(TpmEngine::new(Arc::new(tpm.clone())));

    handler.seal_vault_secrets(INIT_RECORD, &base).unwrap();

    for suffix in ["_keys", "_keysbase64", "_roottoken"] {
        for ext in [".prv", ".pub"] {
            let name = format!("resp-init.json{}{}", suffix, ext);
            assert!(dir.path().join(&name).is_file(), "missing {}", name);
        }
    }
    let record = HandleLedger::in_dir(dir.path()).read_record().unwrap().unwrap();
    assert_eq!(record.template, KeyTemplate::Rsa);
    assert_eq!(tpm.primary_handles(), vec![record.handle]);
    assert_eq!(tpm.loaded_sessions(), 0);
}

/// A missing field file fails the whole unseal
#[test]
fn test_missing_field_fails() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("resp-init.json");
    let tpm = SimulatedTpm::new("sim-store-missing-field");
    let handler = TpmSecretHandler::new(TpmEngine::new(Arc::new(tpm)));

    handler.seal_vault_secrets(INIT_RECORD, &base).unwrap();
    std::fs::remove_file(dir.path().join("resp-init.json_roottoken.pub")).unwrap();

    let err = handler.unseal_vault_secrets(&base).unwrap_err();
    assert!(matches!(err, TpmError::Storage { .. }), "got {err}");
}

/// A record with an empty root token is refused
#[test]
fn test_empty_root_token_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let tpm = SimulatedTpm::new("sim-store-empty-token");
    let handler = TpmSecretHandler::new(TpmEngine::new(Arc::new(tpm.clone())));

    let err = handler
        .seal_vault_secrets(
            br#"{"keys":["a"],"keys_base64":["YQ=="],"root_token":""}"#,
            &dir.path().join("resp-init.json"),
        )
        .unwrap_err();
    assert!(matches!(err, TpmError::Bundle(_)), "got {err}");
    assert_eq!(tpm.stats().channels_opened, 0);
}

/// Plaintext store writes the record unchanged
#[test]
fn test_plaintext_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("resp-init.json");

    let store = SecretStore::from_config(&TpmConfig::simulation().with_secret_store("plaintext")).unwrap();
    assert_eq!(store.kind(), "plaintext");

    store.seal_vault_secrets(INIT_RECORD, &path).unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), INIT_RECORD);
    assert_eq!(store.unseal_vault_secrets(&path).unwrap().as_slice(), INIT_RECORD);
    assert_eq!(
        store.load_root_token(&path).unwrap().as_str(),
        "s.Qf1s5zigZ4OX6akYjQXJC1jY"
    );
    assert!(!HandleLedger::in_dir(dir.path()).exists());
}

/// Store configuration read from TOML
#[test]
fn test_store_from_toml() {
    let config = TpmConfig::from_toml(
        r#"
        backend = "simulation"
        key_template = "ECC"
        secret_store = "tpm"
        "#,
    )
    .unwrap();
    assert_eq!(config.template(), KeyTemplate::Ecc);

    let store = SecretStore::from_config(&config).unwrap();
    match store {
        SecretStore::Tpm(handler) => {
            assert_eq!(handler.engine().default_template(), KeyTemplate::Ecc)
        }
        other => panic!("expected tpm store, got {:?}", other),
    }
}
