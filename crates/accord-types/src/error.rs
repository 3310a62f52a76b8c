use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid byte length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("truncated integer at offset {0}")]
    TruncatedInteger(usize),

    #[error("non-canonical integer encoding at offset {0}")]
    NonCanonicalInteger(usize),

    #[error("integer overflow at offset {0}")]
    IntegerOverflow(usize),
}
