use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerError {
    /// The belief queue is at capacity. The message was not accepted.
    #[error("belief queue full (capacity {0})")]
    QueueFull(usize),

    #[error("transaction queue full (capacity {0})")]
    TransactionQueueFull(usize),

    /// The propagator has stopped and accepts no more work.
    #[error("peer is shut down")]
    Shutdown,

    #[error("consensus error: {0}")]
    Consensus(#[from] accord_consensus::ConsensusError),

    #[error("data error: {0}")]
    Data(#[from] accord_store::DataError),

    #[error("protocol error: {0}")]
    Protocol(#[from] accord_protocol::ProtocolError),

    /// A peer task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PeerResult<T> = Result<T, PeerError>;
