use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use accord_protocol::{Connection, Message, ProtocolError};
use accord_types::AccountKey;
use tracing::{debug, warn};

/// Outbound connections to other peers, keyed by their account key.
#[derive(Default)]
pub struct ConnectionManager {
    connections: RwLock<HashMap<AccountKey, Arc<dyn Connection>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Replaces and closes any earlier connection to
    /// the same peer.
    pub fn add(&self, key: AccountKey, connection: Arc<dyn Connection>) {
        let previous = self
            .connections
            .write()
            .expect("connections lock poisoned")
            .insert(key, connection);
        if let Some(old) = previous {
            old.close();
        }
        debug!(peer = %key, "connection added");
    }

    pub fn remove(&self, key: &AccountKey) -> Option<Arc<dyn Connection>> {
        let removed = self
            .connections
            .write()
            .expect("connections lock poisoned")
            .remove(key);
        if removed.is_some() {
            debug!(peer = %key, "connection removed");
        }
        removed
    }

    pub fn get(&self, key: &AccountKey) -> Option<Arc<dyn Connection>> {
        self.connections
            .read()
            .expect("connections lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.read().expect("connections lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<AccountKey> {
        self.connections
            .read()
            .expect("connections lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    /// Send `message` to every open connection. Closed connections are
    /// dropped. Returns the number of peers the message was queued for.
    pub fn broadcast(&self, message: &Message) -> usize {
        let targets: Vec<(AccountKey, Arc<dyn Connection>)> = self
            .connections
            .read()
            .expect("connections lock poisoned")
            .iter()
            .map(|(k, c)| (*k, Arc::clone(c)))
            .collect();

        let mut sent = 0;
        let mut closed = Vec::new();
        for (key, connection) in targets {
            match connection.send(message.clone()) {
                Ok(()) => sent += 1,
                Err(ProtocolError::Closed) => closed.push(key),
                Err(e) => warn!(peer = %key, error = %e, "broadcast failed"),
            }
        }
        if !closed.is_empty() {
            let mut connections = self.connections.write().expect("connections lock poisoned");
            for key in closed {
                // Only drop the entry if it was not replaced meanwhile.
                if connections.get(&key).is_some_and(|c| c.is_closed()) {
                    connections.remove(&key);
                    debug!(peer = %key, "dropped closed connection");
                }
            }
        }
        sent
    }

    /// Close and forget every connection.
    pub fn close_all(&self) {
        let drained: Vec<Arc<dyn Connection>> = self
            .connections
            .write()
            .expect("connections lock poisoned")
            .drain()
            .map(|(_, c)| c)
            .collect();
        for connection in drained {
            connection.close();
        }
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use accord_protocol::ProtocolResult;

    #[derive(Default)]
    struct Counting {
        sent: AtomicUsize,
        closed: AtomicBool,
    }

    impl Connection for Counting {
        fn send(&self, _message: Message) -> ProtocolResult<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ProtocolError::Closed);
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn remote_key(&self) -> Option<AccountKey> {
            None
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn key(n: u8) -> AccountKey {
        AccountKey::from_bytes([n; 32])
    }

    #[test]
    fn broadcast_reaches_all() {
        let manager = ConnectionManager::new();
        let a = Arc::new(Counting::default());
        let b = Arc::new(Counting::default());
        manager.add(key(1), a.clone());
        manager.add(key(2), b.clone());

        assert_eq!(manager.broadcast(&Message::status(1)), 2);
        assert_eq!(a.sent.load(Ordering::SeqCst), 1);
        assert_eq!(b.sent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closed_connections_are_pruned() {
        let manager = ConnectionManager::new();
        let a = Arc::new(Counting::default());
        manager.add(key(1), a.clone());
        manager.add(key(2), Arc::new(Counting::default()));
        a.close();

        assert_eq!(manager.broadcast(&Message::status(1)), 1);
        assert_eq!(manager.len(), 1);
        assert!(manager.get(&key(1)).is_none());
    }

    #[test]
    fn replacing_closes_previous() {
        let manager = ConnectionManager::new();
        let first = Arc::new(Counting::default());
        manager.add(key(1), first.clone());
        manager.add(key(1), Arc::new(Counting::default()));
        assert!(first.is_closed());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn close_all_empties() {
        let manager = ConnectionManager::new();
        let a = Arc::new(Counting::default());
        manager.add(key(1), a.clone());
        manager.close_all();
        assert!(manager.is_empty());
        assert!(a.is_closed());
    }
}
