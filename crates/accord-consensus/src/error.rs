use accord_store::DataError;

/// Errors from consensus operations.
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    /// Cell-level failure: missing data, invalid data, bad format or signature.
    #[error(transparent)]
    Data(#[from] DataError),

    /// The block executor refused a finalized block.
    #[error("block {index} could not be applied: {reason}")]
    Execution { index: usize, reason: String },
}

impl ConsensusError {
    /// The hash that could not be resolved, if this is a missing-data error.
    pub fn missing_hash(&self) -> Option<accord_types::Hash> {
        match self {
            Self::Data(e) => e.missing_hash(),
            Self::Execution { .. } => None,
        }
    }
}

/// Result alias for consensus operations.
pub type ConsensusResult<T> = Result<T, ConsensusError>;
