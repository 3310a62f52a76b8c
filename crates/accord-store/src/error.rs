use accord_types::{AccountKey, Hash, TypeError};

/// Errors from cell decoding, resolution, and storage.
///
/// The first four variants are recoverable per input: a caller handling
/// untrusted data discards the offending contribution and carries on.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    /// A required cell is not held directly and not in the store.
    #[error("missing data: {0}")]
    MissingData(Hash),

    /// A cell decoded but violates a structural invariant.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Bytes could not be decoded as a canonical cell.
    #[error("bad format: {0}")]
    BadFormat(String),

    /// A signed value does not verify against its claimed signer.
    #[error("bad signature from {0}")]
    BadSignature(AccountKey),

    /// I/O error from a file-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DataError {
    /// The hash that could not be resolved, if this is a missing-data error.
    pub fn missing_hash(&self) -> Option<Hash> {
        match self {
            Self::MissingData(hash) => Some(*hash),
            _ => None,
        }
    }
}

impl From<TypeError> for DataError {
    fn from(e: TypeError) -> Self {
        Self::BadFormat(e.to_string())
    }
}

/// Result alias for cell and store operations.
pub type DataResult<T> = Result<T, DataError>;
