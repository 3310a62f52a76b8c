use accord_types::AccountKey;

use crate::error::ProtocolResult;
use crate::message::Message;

/// Return path to a remote peer.
///
/// Sending never blocks: a connection that cannot take a message right now
/// fails with [`ProtocolError::Backpressure`](crate::ProtocolError::Backpressure)
/// and the caller decides whether to retry.
pub trait Connection: Send + Sync {
    /// Queue `message` for delivery.
    fn send(&self, message: Message) -> ProtocolResult<()>;

    /// Key of the peer at the other end, once known.
    fn remote_key(&self) -> Option<AccountKey>;

    fn is_closed(&self) -> bool;

    /// Stop delivering. Later sends fail with `Closed`.
    fn close(&self);

    /// Short name for logs.
    fn label(&self) -> String {
        self.remote_key()
            .map_or_else(|| "unknown".to_string(), |k| k.short_id())
    }
}
