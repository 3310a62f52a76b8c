use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Content identifier for any cell.
///
/// A `Hash` is the BLAKE3 digest of a value's canonical encoding. Identical
/// values always encode identically and therefore share a `Hash`, which makes
/// cells deduplicatable and verifiable by anyone holding their bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Length of a hash in bytes.
    pub const LENGTH: usize = 32;

    /// The all-zero hash. Never the digest of a real encoding in practice.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Compute the hash of an encoding.
    pub fn compute(encoding: &[u8]) -> Self {
        Self(*blake3::hash(encoding).as_bytes())
    }

    /// Wrap a pre-computed digest.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Read a hash from the first 32 bytes of a slice.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TypeError> {
        let arr: [u8; 32] = bytes
            .get(..Self::LENGTH)
            .and_then(|b| b.try_into().ok())
            .ok_or(TypeError::InvalidLength {
                expected: Self::LENGTH,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    /// The raw 32-byte digest.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        if bytes.len() != Self::LENGTH {
            return Err(TypeError::InvalidLength {
                expected: Self::LENGTH,
                actual: bytes.len(),
            });
        }
        Self::from_slice(&bytes)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<Hash> for [u8; 32] {
    fn from(hash: Hash) -> Self {
        hash.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_is_deterministic() {
        let h1 = Hash::compute(b"hello world");
        let h2 = Hash::compute(b"hello world");
        assert_eq!(h1, h2);
    }

    #[test]
    fn different_data_produces_different_hashes() {
        assert_ne!(Hash::compute(b"hello"), Hash::compute(b"world"));
    }

    #[test]
    fn hex_roundtrip() {
        let h = Hash::compute(b"test");
        let parsed = Hash::from_hex(&h.to_hex()).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        let err = Hash::from_hex("abcd").unwrap_err();
        assert_eq!(
            err,
            TypeError::InvalidLength {
                expected: 32,
                actual: 2
            }
        );
    }

    #[test]
    fn from_slice_reads_prefix() {
        let h = Hash::compute(b"prefix");
        let mut bytes = h.as_bytes().to_vec();
        bytes.extend_from_slice(b"trailing");
        assert_eq!(Hash::from_slice(&bytes).unwrap(), h);
        assert!(Hash::from_slice(&bytes[..31]).is_err());
    }

    #[test]
    fn display_is_full_hex() {
        let h = Hash::compute(b"test");
        assert_eq!(format!("{h}").len(), 64);
        assert_eq!(h.short_hex().len(), 8);
    }

    #[test]
    fn ordering_is_bytewise() {
        let low = Hash::from_bytes([0; 32]);
        let high = Hash::from_bytes([0xff; 32]);
        let mut mid = [0u8; 32];
        mid[31] = 1;
        assert!(low < Hash::from_bytes(mid));
        assert!(Hash::from_bytes(mid) < high);
    }

    #[test]
    fn serde_roundtrip() {
        let h = Hash::compute(b"serde test");
        let json = serde_json::to_string(&h).unwrap();
        let parsed: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(h, parsed);
    }
}
