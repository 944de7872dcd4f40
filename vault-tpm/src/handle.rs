//! TPM handle values

use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric identifier of a TPM-resident object or session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TpmHandle(u32);

impl TpmHandle {
    /// Sentinel for "no usable handle"
    pub const NULL: TpmHandle = TpmHandle(0);

    /// First handle of the transient object range (TPM_HT_TRANSIENT)
    pub const TRANSIENT_FIRST: u32 = 0x8000_0000;

    /// First handle of the persistent object range (TPM_HT_PERSISTENT)
    pub const PERSISTENT_FIRST: u32 = 0x8100_0000;

    /// Last handle of the owner persistent range
    pub const PERSISTENT_OWNER_LAST: u32 = 0x817F_FFFF;

    /// First handle of the policy session range (TPM_HT_POLICY_SESSION)
    pub const POLICY_SESSION_FIRST: u32 = 0x0300_0000;

    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// True for handles in the persistent object range
    pub const fn is_persistent(self) -> bool {
        self.0 >> 24 == 0x81
    }

    /// Parse a handle written as `0x`-prefixed hex or plain decimal
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => text.parse::<u32>(),
        };
        parsed.ok().map(TpmHandle)
    }
}

impl From<u32> for TpmHandle {
    fn from(value: u32) -> Self {
        TpmHandle(value)
    }
}

impl fmt::Display for TpmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}
