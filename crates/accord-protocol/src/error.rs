use accord_store::DataError;
use thiserror::Error;

use crate::message::MessageType;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("framing error: {0}")]
    FramingError(String),

    /// The message data did not decode, or decoded to invalid cells.
    #[error("bad payload: {0}")]
    Payload(#[from] DataError),

    #[error("unexpected payload for {kind}: {detail}")]
    UnexpectedPayload { kind: MessageType, detail: String },

    #[error("message has no return connection")]
    NoConnection,

    #[error("connection closed")]
    Closed,

    #[error("connection send buffer full")]
    Backpressure,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
