use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Public identity of a peer: the raw bytes of its Ed25519 verifying key.
///
/// Beliefs are keyed by `AccountKey`, and every signed value names the key
/// that must verify it. Keys order bytewise, which gives Beliefs a canonical
/// entry order independent of insertion.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountKey([u8; 32]);

impl AccountKey {
    /// Length of a key in bytes.
    pub const LENGTH: usize = 32;

    /// Create from raw public key bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Random key bytes for tests and demos. Not a valid curve point in general.
    pub fn ephemeral() -> Self {
        let mut bytes = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    /// The raw 32-byte key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full hex-encoded string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short identifier (first 8 hex characters, `#` prefixed).
    pub fn short_id(&self) -> String {
        format!("#{}", hex::encode(&self.0[..4]))
    }

    /// Parse from a hex string, with or without a leading `0x`.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        if bytes.len() != Self::LENGTH {
            return Err(TypeError::InvalidLength {
                expected: Self::LENGTH,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountKey({})", self.short_id())
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_id())
    }
}
