//! TPM engine error types

use crate::device::{DeviceFault, TpmCommand};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for TPM engine operations
pub type TpmResult<T> = std::result::Result<T, TpmError>;

/// Policy session construction stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    /// TPM2_StartAuthSession
    Start,
    /// TPM2_PolicyPCR
    BindPcr,
    /// TPM2_PolicyPassword
    RequirePassword,
    /// TPM2_PolicyGetDigest
    ReadDigest,
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            SessionStage::Start => "start",
            SessionStage::BindPcr => "PCR binding",
            SessionStage::RequirePassword => "password requirement",
            SessionStage::ReadDigest => "digest retrieval",
        };
        f.write_str(stage)
    }
}

/// Coarse error taxonomy used by callers to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Bad input, detected before the device is touched
    Validation,
    /// The device could not be opened
    DeviceUnavailable,
    /// Primary key or policy session could not be established
    KeySession,
    /// A seal, load or unseal command failed
    Command,
    /// Ledger or blob files are missing, unreadable or corrupt
    Storage,
    /// Configuration or build-time feature problem
    Config,
}

/// TPM engine error types
#[derive(Error, Debug)]
pub enum TpmError {
    /// Input rejected before any device interaction
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Device channel could not be opened
    #[error("TPM device unavailable at {path}: {reason}")]
    DeviceUnavailable { path: String, reason: String },

    /// Primary key (SRK) creation failed
    #[error("Primary key creation failed: {0}")]
    PrimaryKey(#[source] DeviceFault),

    /// Policy session construction failed at the given stage
    #[error("Policy session {stage} failed: {fault}")]
    Session {
        stage: SessionStage,
        #[source]
        fault: DeviceFault,
    },

    /// Seal, load or unseal command failed
    #[error("{0}")]
    Command(#[from] DeviceFault),

    /// Parent handle ledger exists but cannot be parsed
    #[error("Parent handle ledger {path} is corrupt: {reason}")]
    LedgerCorrupt { path: PathBuf, reason: String },

    /// Ledger or blob file could not be read or written
    #[error("Storage error at {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Secret bundle could not be split or recomposed
    #[error("Secret bundle error: {0}")]
    Bundle(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Feature not enabled at compile time
    #[error("Feature not enabled: {0}")]
    FeatureNotEnabled(String),
}

impl TpmError {
    /// Build a storage error for the given path
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TpmError::Storage {
            path: path.into(),
            source,
        }
    }

    /// Build a session error for the given stage
    pub fn session(stage: SessionStage, fault: DeviceFault) -> Self {
        TpmError::Session { stage, fault }
    }

    /// The taxonomy bucket this error belongs to
    pub fn category(&self) -> ErrorCategory {
        match self {
            TpmError::Validation(_) | TpmError::Bundle(_) => ErrorCategory::Validation,
            TpmError::DeviceUnavailable { .. } => ErrorCategory::DeviceUnavailable,
            TpmError::PrimaryKey(_) | TpmError::Session { .. } => ErrorCategory::KeySession,
            TpmError::Command(_) => ErrorCategory::Command,
            TpmError::LedgerCorrupt { .. } | TpmError::Storage { .. } => ErrorCategory::Storage,
            TpmError::Config(_) | TpmError::FeatureNotEnabled(_) => ErrorCategory::Config,
        }
    }

    /// The TPM command behind a device-originated error, if any
    pub fn command(&self) -> Option<TpmCommand> {
        match self {
            TpmError::PrimaryKey(fault)
            | TpmError::Session { fault, .. }
            | TpmError::Command(fault) => Some(fault.command),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for TpmError {
    fn from(err: serde_json::Error) -> Self {
        TpmError::Bundle(err.to_string())
    }
}

impl From<toml::de::Error> for TpmError {
    fn from(err: toml::de::Error) -> Self {
        TpmError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let fault = DeviceFault::new(TpmCommand::Load, "bad handle");
        assert_eq!(TpmError::from(fault).category(), ErrorCategory::Command);

        let fault = DeviceFault::new(TpmCommand::PolicyPcr, "no");
        let err = TpmError::session(SessionStage::BindPcr, fault);
        assert_eq!(err.category(), ErrorCategory::KeySession);
        assert_eq!(err.command(), Some(TpmCommand::PolicyPcr));

        let err = TpmError::storage(
            "/tmp/x.pub",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        assert_eq!(err.category(), ErrorCategory::Storage);
        assert_eq!(err.command(), None);
    }

    #[test]
    fn test_display_names_stage() {
        let fault = DeviceFault::new(TpmCommand::PolicyGetDigest, "rc 0x99d");
        let err = TpmError::session(SessionStage::ReadDigest, fault);
        assert!(err.to_string().contains("digest retrieval"));
        assert!(err.to_string().contains("PolicyGetDigest"));
    }
}
