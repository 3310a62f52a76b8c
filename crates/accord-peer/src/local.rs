use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use accord_protocol::{Connection, FrameCodec, Message, ProtocolError, ProtocolResult};
use accord_types::AccountKey;
use tokio::sync::mpsc;
use tracing::trace;

/// In-process connection delivering into another peer's inbound channel.
///
/// Messages pass through the frame encoding, so the receiving side sees raw
/// data and decodes it lazily, exactly as it would from a socket. Each
/// delivered message carries the reverse connection for replies.
pub struct LocalConnection {
    remote: AccountKey,
    target: mpsc::Sender<Message>,
    reverse: OnceLock<Weak<LocalConnection>>,
    closed: AtomicBool,
}

impl LocalConnection {
    /// Connect two peers by their inbound channels. Returns the connection
    /// from `a` to `b` and the one from `b` to `a`.
    pub fn pair(
        a: AccountKey,
        a_inbound: mpsc::Sender<Message>,
        b: AccountKey,
        b_inbound: mpsc::Sender<Message>,
    ) -> (Arc<Self>, Arc<Self>) {
        let a_to_b = Arc::new(Self::new(b, b_inbound));
        let b_to_a = Arc::new(Self::new(a, a_inbound));
        let _ = a_to_b.reverse.set(Arc::downgrade(&b_to_a));
        let _ = b_to_a.reverse.set(Arc::downgrade(&a_to_b));
        (a_to_b, b_to_a)
    }

    fn new(remote: AccountKey, target: mpsc::Sender<Message>) -> Self {
        Self {
            remote,
            target,
            reverse: OnceLock::new(),
            closed: AtomicBool::new(false),
        }
    }
}

impl Connection for LocalConnection {
    fn send(&self, message: Message) -> ProtocolResult<()> {
        if self.is_closed() {
            return Err(ProtocolError::Closed);
        }
        let frame = FrameCodec::encode(&message)?;
        let (mut delivered, _) = FrameCodec::decode(&frame)?;
        if let Some(reverse) = self.reverse.get().and_then(Weak::upgrade) {
            delivered = delivered.with_connection(reverse);
        }
        trace!(to = %self.remote, kind = %message.kind(), bytes = frame.len(), "local send");
        self.target.try_send(delivered).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ProtocolError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => {
                self.close();
                ProtocolError::Closed
            }
        })
    }

    fn remote_key(&self) -> Option<AccountKey> {
        Some(self.remote)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for LocalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConnection")
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}
