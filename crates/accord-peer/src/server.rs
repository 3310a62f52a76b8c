use std::sync::Arc;
use std::time::Duration;

use accord_consensus::{BlockExecutor, ConsensusState, Peer};
use accord_crypto::KeyPair;
use accord_protocol::Message;
use accord_store::{Ref, Store, Transaction};
use accord_types::AccountKey;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::PeerConfig;
use crate::connections::ConnectionManager;
use crate::error::{PeerError, PeerResult};
use crate::handler::MessageHandler;
use crate::local::LocalConnection;
use crate::propagator::{BeliefPropagator, PeerSnapshot, PropagatorStats};
use crate::transactions::TransactionQueue;

/// A running peer: the belief propagator and the inbound dispatcher, each on
/// its own task, sharing one store.
pub struct PeerServer {
    key: AccountKey,
    store: Arc<dyn Store>,
    connections: Arc<ConnectionManager>,
    transactions: Arc<TransactionQueue>,
    inbound: mpsc::Sender<Message>,
    snapshot: watch::Receiver<Arc<PeerSnapshot>>,
    stats: Arc<PropagatorStats>,
    shutdown: watch::Sender<bool>,
    propagator: JoinHandle<PeerResult<Peer>>,
    dispatcher: JoinHandle<()>,
}

impl PeerServer {
    /// Open the configured store and start both tasks. Must be called from
    /// within a tokio runtime.
    pub fn launch(
        key_pair: KeyPair,
        genesis: ConsensusState,
        executor: Arc<dyn BlockExecutor>,
        config: PeerConfig,
    ) -> PeerResult<Self> {
        config.validate()?;
        let store = config.store.open()?;
        Self::launch_with_store(key_pair, genesis, executor, config, store)
    }

    /// Start with a caller-supplied store.
    pub fn launch_with_store(
        key_pair: KeyPair,
        genesis: ConsensusState,
        executor: Arc<dyn BlockExecutor>,
        config: PeerConfig,
        store: Arc<dyn Store>,
    ) -> PeerResult<Self> {
        let key = key_pair.account_key();
        let peer = Peer::new(key_pair, genesis, executor).with_threshold(config.threshold);
        let connections = Arc::new(ConnectionManager::new());
        let transactions = Arc::new(TransactionQueue::new(
            config.transaction_queue_capacity,
            config.max_block_transactions,
        ));
        let (inbound, inbound_rx) = mpsc::channel(config.inbound_queue_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let (propagator, beliefs, snapshot) = BeliefPropagator::new(
            peer,
            Arc::clone(&store),
            Arc::clone(&connections),
            Arc::clone(&transactions) as Arc<dyn accord_consensus::BlockProducer>,
            config,
        );
        let stats = Arc::clone(propagator.stats());
        let handler = MessageHandler::new(
            Arc::clone(&store),
            beliefs,
            Arc::clone(&transactions),
            Arc::clone(&connections),
            snapshot.clone(),
        );

        let propagator = tokio::spawn(propagator.run(shutdown_rx.clone()));
        let dispatcher = tokio::spawn(handler.run(inbound_rx, shutdown_rx));
        info!(peer = %key, "peer started");

        Ok(Self {
            key,
            store,
            connections,
            transactions,
            inbound,
            snapshot,
            stats,
            shutdown,
            propagator,
            dispatcher,
        })
    }

    pub fn key(&self) -> &AccountKey {
        &self.key
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn stats(&self) -> &Arc<PropagatorStats> {
        &self.stats
    }

    /// Sender for messages addressed to this peer.
    pub fn inbound(&self) -> mpsc::Sender<Message> {
        self.inbound.clone()
    }

    /// State published after the most recent iteration.
    pub fn snapshot(&self) -> Arc<PeerSnapshot> {
        Arc::clone(&self.snapshot.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<PeerSnapshot>> {
        self.snapshot.clone()
    }

    /// Add a transaction to the pending pool.
    pub fn submit_transaction(&self, transaction: Transaction) -> PeerResult<Ref> {
        self.transactions.submit(transaction)
    }

    pub fn pending_transactions(&self) -> usize {
        self.transactions.len()
    }

    /// Connect this peer and `other` in both directions.
    pub fn connect(&self, other: &PeerServer) {
        let (to_other, to_self) =
            LocalConnection::pair(self.key, self.inbound(), other.key, other.inbound());
        self.connections.add(other.key, to_other);
        other.connections.add(self.key, to_self);
    }

    /// Wait until a published snapshot satisfies `done`. Returns the
    /// snapshot, or `None` if `timeout` passes first.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        mut done: impl FnMut(&PeerSnapshot) -> bool,
    ) -> Option<Arc<PeerSnapshot>> {
        let mut updates = self.subscribe();
        let waiting = async {
            loop {
                let current = Arc::clone(&updates.borrow_and_update());
                if done(&current) {
                    return Some(current);
                }
                if updates.changed().await.is_err() {
                    return None;
                }
            }
        };
        tokio::time::timeout(timeout, waiting).await.ok().flatten()
    }

    /// Say goodbye to every connected peer, stop both tasks and return the
    /// final peer state.
    pub async fn shutdown(self) -> PeerResult<Peer> {
        self.connections.broadcast(&Message::goodbye());
        self.connections.close_all();
        let _ = self.shutdown.send(true);

        if let Err(e) = self.dispatcher.await {
            warn!(peer = %self.key, error = %e, "dispatcher task failed");
        }
        let peer = self
            .propagator
            .await
            .map_err(|e| PeerError::Task(e.to_string()))??;
        info!(peer = %self.key, consensus_point = peer.consensus_point(), "peer stopped");
        Ok(peer)
    }
}

impl std::fmt::Debug for PeerServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerServer")
            .field("key", &self.key)
            .field("connections", &self.connections.len())
            .field("pending_transactions", &self.transactions.len())
            .finish()
    }
}
