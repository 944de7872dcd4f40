//! Primary key template selection

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Public-key template used when creating a primary key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyTemplate {
    /// RSA 2048 storage key with AES-128-CFB symmetric protection
    #[default]
    Rsa,
    /// ECC NIST P-256 storage key with AES-128-CFB symmetric protection
    Ecc,
}

impl KeyTemplate {
    /// Strict parse, case-insensitive. The display form (`"ECC Template"`)
    /// is accepted too, since older ledgers recorded it.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_uppercase();
        let name = name.strip_suffix("TEMPLATE").map(str::trim_end).unwrap_or(name.as_str());
        match name {
            "RSA" => Some(KeyTemplate::Rsa),
            "ECC" => Some(KeyTemplate::Ecc),
            _ => None,
        }
    }

    /// Resolve an optional preference; blank means default and unknown
    /// names fall back to the default with a warning.
    pub fn resolve(preference: Option<&str>) -> Self {
        let name = match preference.map(str::trim) {
            None | Some("") => return KeyTemplate::default(),
            Some(name) => name,
        };
        KeyTemplate::from_name(name).unwrap_or_else(|| {
            warn!(
                target: "vault::tpm",
                "Unknown key template '{}', falling back to {}",
                name,
                KeyTemplate::default()
            );
            KeyTemplate::default()
        })
    }

    /// Name recorded in the parent handle ledger
    pub fn name(self) -> &'static str {
        match self {
            KeyTemplate::Rsa => "RSA",
            KeyTemplate::Ecc => "ECC",
        }
    }
}

impl fmt::Display for KeyTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Template", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve() {
        assert_eq!(KeyTemplate::resolve(None), KeyTemplate::Rsa);
        assert_eq!(KeyTemplate::resolve(Some("  ")), KeyTemplate::Rsa);
        assert_eq!(KeyTemplate::resolve(Some("ecc")), KeyTemplate::Ecc);
        assert_eq!(KeyTemplate::resolve(Some(" Ecc ")), KeyTemplate::Ecc);
        assert_eq!(KeyTemplate::resolve(Some("RSA")), KeyTemplate::Rsa);
    }

    #[test]
    fn test_unknown_falls_back_to_rsa() {
        assert_eq!(KeyTemplate::resolve(Some("quantum")), KeyTemplate::Rsa);
        assert_eq!(KeyTemplate::from_name("quantum"), None);
    }

    #[test]
    fn test_display_form_parses() {
        for template in [KeyTemplate::Rsa, KeyTemplate::Ecc] {
            assert_eq!(KeyTemplate::from_name(&template.to_string()), Some(template));
        }
        assert_eq!(KeyTemplate::from_name("ecc template"), Some(KeyTemplate::Ecc));
        assert_eq!(KeyTemplate::from_name("Template"), None);
    }
}
