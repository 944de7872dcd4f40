//! Vault unlock record codec
//!
//! A seal protects a single byte string of limited size, so the vault init
//! record is sealed as three fields under suffixed output paths. List fields
//! are joined with [`SEPARATOR`].

use crate::error::{TpmError, TpmResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Joins list-valued fields
pub const SEPARATOR: char = ',';

/// Largest sealable field in bytes (MAX_SYM_DATA of a keyed-hash object)
pub const MAX_FIELD_LEN: usize = 128;

/// Output path suffix of the key shares field
pub const KEYS_SUFFIX: &str = "_keys";

/// Output path suffix of the base64 key shares field
pub const KEYS_BASE64_SUFFIX: &str = "_keysbase64";

/// Output path suffix of the root token field
pub const ROOT_TOKEN_SUFFIX: &str = "_roottoken";

/// Vault init record: unseal key shares and the root token
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct SecretBundle {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub keys_base64: Vec<String>,
    #[serde(default)]
    pub root_token: String,
}

impl SecretBundle {
    pub fn new(keys: Vec<String>, keys_base64: Vec<String>, root_token: impl Into<String>) -> Self {
        Self {
            keys,
            keys_base64,
            root_token: root_token.into(),
        }
    }

    /// Decode the JSON record produced by vault initialization
    pub fn from_json(bytes: &[u8]) -> TpmResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> TpmResult<Zeroizing<Vec<u8>>> {
        Ok(Zeroizing::new(serde_json::to_vec(self)?))
    }
}

impl fmt::Debug for SecretBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretBundle")
            .field("keys", &self.keys.len())
            .field("keys_base64", &self.keys_base64.len())
            .field("root_token", &"<redacted>")
            .finish()
    }
}

/// The three independently sealed fields of a [`SecretBundle`]
#[derive(Clone, PartialEq, Eq)]
pub struct BundleFields {
    pub keys: Zeroizing<String>,
    pub keys_base64: Zeroizing<String>,
    pub root_token: Zeroizing<String>,
}

impl fmt::Debug for BundleFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleFields")
            .field("keys_len", &self.keys.len())
            .field("keys_base64_len", &self.keys_base64.len())
            .field("root_token_len", &self.root_token.len())
            .finish()
    }
}

fn join_list(name: &str, items: &[String]) -> TpmResult<Zeroizing<String>> {
    if items.is_empty() {
        return Err(TpmError::Bundle(format!("{} is empty", name)));
    }
    if let Some(index) = items.iter().position(|item| item.contains(SEPARATOR)) {
        return Err(TpmError::Bundle(format!(
            "{}[{}] contains the separator '{}'",
            name, index, SEPARATOR
        )));
    }
    Ok(Zeroizing::new(items.join(&SEPARATOR.to_string())))
}

fn check_len(name: &str, field: &str) -> TpmResult<()> {
    if field.len() > MAX_FIELD_LEN {
        return Err(TpmError::Bundle(format!(
            "{} is {} bytes, a sealed field holds at most {}",
            name,
            field.len(),
            MAX_FIELD_LEN
        )));
    }
    Ok(())
}

fn split_list(field: &str) -> Vec<String> {
    field.split(SEPARATOR).map(str::to_string).collect()
}

/// Split a bundle into its sealable fields.
///
/// Fields containing the separator are rejected, since they could not be
/// reconstructed. So are fields longer than [`MAX_FIELD_LEN`] once joined.
pub fn split(bundle: &SecretBundle) -> TpmResult<BundleFields> {
    let keys = join_list("keys", &bundle.keys)?;
    let keys_base64 = join_list("keys_base64", &bundle.keys_base64)?;

    if bundle.root_token.is_empty() {
        return Err(TpmError::Bundle("root_token is empty".to_string()));
    }
    if bundle.root_token.contains(SEPARATOR) {
        return Err(TpmError::Bundle(format!(
            "root_token contains the separator '{}'",
            SEPARATOR
        )));
    }

    check_len("keys", &keys)?;
    check_len("keys_base64", &keys_base64)?;
    check_len("root_token", &bundle.root_token)?;

    Ok(BundleFields {
        keys,
        keys_base64,
        root_token: Zeroizing::new(bundle.root_token.clone()),
    })
}

/// Recompose a bundle from its unsealed fields
pub fn join(keys: &str, keys_base64: &str, root_token: &str) -> SecretBundle {
    SecretBundle {
        keys: split_list(keys),
        keys_base64: split_list(keys_base64),
        root_token: root_token.to_string(),
    }
}

/// Output paths of the three fields for logical path `base`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePaths {
    pub keys: PathBuf,
    pub keys_base64: PathBuf,
    pub root_token: PathBuf,
}

impl BundlePaths {
    pub fn for_base(base: &Path) -> Self {
        Self {
            keys: crate::fs::with_suffix(base, KEYS_SUFFIX),
            keys_base64: crate::fs::with_suffix(base, KEYS_BASE64_SUFFIX),
            root_token: crate::fs::with_suffix(base, ROOT_TOKEN_SUFFIX),
        }
    }

    /// All three paths, in sealing order
    pub fn all(&self) -> [&Path; 3] {
        [&self.keys, &self.keys_base64, &self.root_token]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> SecretBundle {
        SecretBundle::new(
            vec!["k1".to_string(), "k2".to_string()],
            vec!["b1".to_string(), "b2".to_string()],
            "rt",
        )
    }

    #[test]
    fn test_split_and_join() {
        let fields = split(&sample()).unwrap();
        assert_eq!(fields.keys.as_str(), "k1,k2");
        assert_eq!(fields.keys_base64.as_str(), "b1,b2");
        assert_eq!(fields.root_token.as_str(), "rt");

        let bundle = join(&fields.keys, &fields.keys_base64, &fields.root_token);
        assert_eq!(bundle.keys, vec!["k1", "k2"]);
        assert_eq!(bundle, sample());
    }

    #[test]
    fn test_separator_in_field_is_rejected() {
        let mut bundle = sample();
        bundle.keys[1] = "k,2".to_string();
        let err = split(&bundle).unwrap_err();
        assert!(err.to_string().contains("keys[1]"));

        let mut bundle = sample();
        bundle.root_token = "r,t".to_string();
        assert!(matches!(split(&bundle), Err(TpmError::Bundle(_))));
    }

    #[test]
    fn test_empty_fields_are_rejected() {
        let mut bundle = sample();
        bundle.keys.clear();
        assert!(split(&bundle).is_err());

        let mut bundle = sample();
        bundle.root_token.clear();
        assert!(split(&bundle).is_err());
    }

    #[test]
    fn test_field_size_limit() {
        // One 32-byte share, hex encoded, fits; two joined do not
        let shares = |n: usize| (0..n).map(|i| format!("{:064x}", i)).collect::<Vec<_>>();
        let mut bundle = sample();
        bundle.keys = shares(1);
        assert!(split(&bundle).is_ok());

        bundle.keys = shares(2);
        let err = split(&bundle).unwrap_err();
        assert!(err.to_string().contains("keys is 129 bytes"), "{err}");

        let mut bundle = sample();
        bundle.root_token = "t".repeat(MAX_FIELD_LEN);
        assert!(split(&bundle).is_ok());
        bundle.root_token.push('t');
        assert!(matches!(split(&bundle), Err(TpmError::Bundle(_))));
    }

    #[test]
    fn test_json_uses_vault_field_names() {
        let json = br#"{"keys":["a"],"keys_base64":["YQ=="],"root_token":"s.x","recovery_keys":null}"#;
        let bundle = SecretBundle::from_json(json).unwrap();
        assert_eq!(bundle.keys_base64, vec!["YQ=="]);
        assert_eq!(bundle.root_token, "s.x");

        let encoded = String::from_utf8(bundle.to_json().unwrap().to_vec()).unwrap();
        assert_eq!(encoded, r#"{"keys":["a"],"keys_base64":["YQ=="],"root_token":"s.x"}"#);
        assert!(!format!("{:?}", bundle).contains("s.x"));
    }

    #[test]
    fn test_bundle_paths() {
        let paths = BundlePaths::for_base(Path::new("/vault/res/resp-init.json"));
        assert_eq!(paths.keys, PathBuf::from("/vault/res/resp-init.json_keys"));
        assert_eq!(
            paths.keys_base64,
            PathBuf::from("/vault/res/resp-init.json_keysbase64")
        );
        assert_eq!(
            paths.root_token,
            PathBuf::from("/vault/res/resp-init.json_roottoken")
        );
    }

    proptest! {
        #[test]
        fn prop_split_join_restores_bundle(
            keys in prop::collection::vec("[a-f0-9]{1,16}", 1..6),
            keys_base64 in prop::collection::vec("[A-Za-z0-9+/=]{1,16}", 1..6),
            root_token in "[a-zA-Z0-9.]{1,24}",
        ) {
            let bundle = SecretBundle::new(keys, keys_base64, root_token);
            let fields = split(&bundle).unwrap();
            prop_assert_eq!(join(&fields.keys, &fields.keys_base64, &fields.root_token), bundle);
        }
    }
}
