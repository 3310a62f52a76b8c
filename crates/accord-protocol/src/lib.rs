//! Peer wire protocol for Accord.
//!
//! Defines the message kinds peers exchange, the multi-cell data format
//! their payloads use, the framing on byte streams, and the [`Connection`]
//! return path used to report results and request missing data.

pub mod codec;
pub mod connection;
pub mod data;
pub mod error;
pub mod message;

pub use codec::FrameCodec;
pub use connection::Connection;
pub use data::{decode_multi, encode_multi, Payload};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{ErrorCode, Message, MessageType, ResultRecord};
