//! Belief propagation loop.
//!
//! Each iteration:
//!
//! 1. waits up to `await_beliefs` for a belief message, then drains whatever
//!    else is queued without waiting;
//! 2. stores the cells that came with each message and checks it resolves,
//!    asking the sender for anything missing and parking the message until
//!    the data arrives;
//! 3. merges the resolvable beliefs, then merges once more so the local
//!    points reflect the new local order. Discarded orders are reported to
//!    the peer that sent them. If the batch cannot be merged each belief is
//!    merged on its own so one bad input cannot hold back the rest;
//! 4. lets the block producer propose a block;
//! 5. broadcasts the belief if it changed or the minimum spacing has passed,
//!    with the novel cells attached, and every `rebroadcast_delay` with all
//!    cells of the local order so lagging peers can catch up;
//! 6. persists the belief and publishes a [`PeerSnapshot`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use accord_consensus::{BlockProducer, ConsensusError, Peer, Rejected, Rejection};
use accord_protocol::{ErrorCode, Message};
use accord_store::refs::find_missing;
use accord_store::{
    announce, persist, persist_shallow, Belief, Cell, DataError, IgnoreNovelty, Ref, Store,
};
use accord_types::{AccountKey, Hash, MAX_MESSAGE_LENGTH};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::PeerConfig;
use crate::connections::ConnectionManager;
use crate::error::{PeerError, PeerResult};

/// Most missing-data requests sent for one message per iteration.
const MAX_MISSING_REQUESTS: usize = 64;

/// Share of the message limit above which a belief message is logged as long.
const LONG_MESSAGE_FRACTION: f64 = 0.95;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

/// Counters kept by the propagator. Shared with the server for reporting.
#[derive(Debug, Default)]
pub struct PropagatorStats {
    beliefs_received: AtomicU64,
    beliefs_rejected: AtomicU64,
    broadcasts_sent: AtomicU64,
    missing_requests: AtomicU64,
}

impl PropagatorStats {
    pub fn beliefs_received(&self) -> u64 {
        self.beliefs_received.load(Ordering::Relaxed)
    }

    /// Belief messages discarded as malformed or unresolvable, plus orders
    /// discarded during a merge.
    pub fn beliefs_rejected(&self) -> u64 {
        self.beliefs_rejected.load(Ordering::Relaxed)
    }

    pub fn broadcasts_sent(&self) -> u64 {
        self.broadcasts_sent.load(Ordering::Relaxed)
    }

    pub fn missing_requests(&self) -> u64 {
        self.missing_requests.load(Ordering::Relaxed)
    }
}

/// Read-only view of a peer, published after every iteration.
#[derive(Clone, Debug)]
pub struct PeerSnapshot {
    pub key: AccountKey,
    pub timestamp: i64,
    pub belief: Arc<Belief>,
    pub order_length: usize,
    pub proposal_point: usize,
    pub consensus_point: usize,
    pub executed: usize,
    pub state_hash: Hash,
    /// Hash of the belief last sent to other peers.
    pub last_broadcast: Option<Hash>,
    pub beliefs_received: u64,
    pub broadcasts_sent: u64,
}

impl PeerSnapshot {
    fn of(peer: &Peer, stats: &PropagatorStats, last_broadcast: Option<Hash>) -> Self {
        Self {
            key: *peer.key(),
            timestamp: peer.timestamp(),
            belief: Arc::clone(peer.belief()),
            order_length: peer.own_order().len(),
            proposal_point: peer.proposal_point(),
            consensus_point: peer.consensus_point(),
            executed: peer.executed_count(),
            state_hash: peer.state().state_hash,
            last_broadcast,
            beliefs_received: stats.beliefs_received(),
            broadcasts_sent: stats.broadcasts_sent(),
        }
    }
}

/// Sending side of the bounded belief queue.
#[derive(Clone, Debug)]
pub struct BeliefQueue {
    tx: mpsc::Sender<Message>,
    capacity: usize,
}

impl BeliefQueue {
    /// Queue a belief message for the next iteration. A full queue rejects
    /// the message with [`PeerError::QueueFull`].
    pub fn queue_belief(&self, message: Message) -> PeerResult<()> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PeerError::QueueFull(self.capacity),
            mpsc::error::TrySendError::Closed(_) => PeerError::Shutdown,
        })
    }
}

struct Parked {
    message: Message,
    attempts: u32,
}

/// Owns a [`Peer`] and drives it from incoming beliefs.
pub struct BeliefPropagator {
    peer: Peer,
    store: Arc<dyn Store>,
    connections: Arc<ConnectionManager>,
    producer: Arc<dyn BlockProducer>,
    config: PeerConfig,
    inbox: mpsc::Receiver<Message>,
    parked: Vec<Parked>,
    last_broadcast: Option<Instant>,
    last_full_broadcast: Option<Instant>,
    last_broadcast_belief: Option<Hash>,
    stats: Arc<PropagatorStats>,
    snapshot: watch::Sender<Arc<PeerSnapshot>>,
}

impl BeliefPropagator {
    /// Create a propagator with its queue and snapshot channel.
    pub fn new(
        peer: Peer,
        store: Arc<dyn Store>,
        connections: Arc<ConnectionManager>,
        producer: Arc<dyn BlockProducer>,
        config: PeerConfig,
    ) -> (Self, BeliefQueue, watch::Receiver<Arc<PeerSnapshot>>) {
        let capacity = config.belief_queue_capacity;
        let (tx, inbox) = mpsc::channel(capacity);
        let stats = Arc::new(PropagatorStats::default());
        let (snapshot, snapshot_rx) =
            watch::channel(Arc::new(PeerSnapshot::of(&peer, &stats, None)));
        let propagator = Self {
            peer,
            store,
            connections,
            producer,
            config,
            inbox,
            parked: Vec::new(),
            last_broadcast: None,
            last_full_broadcast: None,
            last_broadcast_belief: None,
            stats,
            snapshot,
        };
        (propagator, BeliefQueue { tx, capacity }, snapshot_rx)
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn stats(&self) -> &Arc<PropagatorStats> {
        &self.stats
    }

    /// Run until `shutdown` turns true or its sender is dropped. Returns the
    /// peer so its final state can be inspected.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> PeerResult<Peer> {
        info!(peer = %self.peer.key(), "belief propagator started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                result = self.step() => match result {
                    Ok(_) => {}
                    Err(PeerError::Shutdown) => break,
                    Err(e) => {
                        error!(peer = %self.peer.key(), error = %e, "belief propagator failed");
                        return Err(e);
                    }
                },
            }
        }
        info!(
            peer = %self.peer.key(),
            consensus_point = self.peer.consensus_point(),
            "belief propagator stopped"
        );
        Ok(self.peer)
    }

    /// One iteration. Returns `true` if the local belief changed.
    pub async fn step(&mut self) -> PeerResult<bool> {
        let batch = self.await_beliefs().await?;
        self.peer.set_timestamp(now_millis());
        let before = Arc::clone(self.peer.belief());

        let incoming = self.collect_beliefs(batch);
        let store = Arc::clone(&self.store);
        if self.merge_incoming(store.as_ref(), &incoming) {
            if let Err(e) = self.peer.merge_beliefs(store.as_ref(), &[]) {
                warn!(error = %e, "could not update local points");
            }
        }

        if let Some(block) = self.producer.maybe_generate_block(&self.peer.view()) {
            let transactions = block.len();
            match self.peer.propose_block(store.as_ref(), block) {
                Ok(block_ref) => debug!(
                    transactions,
                    hash = %block_ref.hash().short_hex(),
                    "new block proposed"
                ),
                Err(e) => warn!(transactions, error = %e, "could not propose block"),
            }
        }

        let updated = !Arc::ptr_eq(&before, self.peer.belief());
        self.maybe_broadcast(updated)?;

        // Persist even without a broadcast so missing-data requests for the
        // belief can be served.
        persist(store.as_ref(), &self.peer.belief_ref(), &mut IgnoreNovelty)?;

        self.snapshot.send_replace(Arc::new(PeerSnapshot::of(
            &self.peer,
            &self.stats,
            self.last_broadcast_belief,
        )));
        Ok(updated)
    }

    /// Wait for the first message, then drain the rest. Parked messages are
    /// retried first.
    async fn await_beliefs(&mut self) -> PeerResult<Vec<Parked>> {
        let mut batch = std::mem::take(&mut self.parked);
        match tokio::time::timeout(self.config.await_beliefs(), self.inbox.recv()).await {
            Ok(Some(message)) => batch.push(Parked {
                message,
                attempts: 0,
            }),
            Ok(None) => return Err(PeerError::Shutdown),
            Err(_elapsed) => return Ok(batch),
        }
        while let Ok(message) = self.inbox.try_recv() {
            batch.push(Parked {
                message,
                attempts: 0,
            });
        }
        Ok(batch)
    }

    /// Decode each message and keep the beliefs that fully resolve, paired
    /// with the message that carried them.
    fn collect_beliefs(&mut self, batch: Vec<Parked>) -> Vec<(Message, Belief)> {
        let store = Arc::clone(&self.store);
        let mut beliefs = Vec::with_capacity(batch.len());
        for Parked { message, attempts } in batch {
            if attempts == 0 {
                self.stats.beliefs_received.fetch_add(1, Ordering::Relaxed);
            }
            let payload = match message.payload() {
                Ok(payload) => payload,
                Err(e) => {
                    self.reject(&message, ErrorCode::Format, &e.to_string());
                    continue;
                }
            };
            let Some(belief) = payload.value().as_belief() else {
                let found = payload.value().type_name();
                self.reject(&message, ErrorCode::Unexpected, &format!("expected belief, found {found}"));
                continue;
            };
            let belief = belief.clone();
            let stored = payload
                .cells()
                .iter()
                .try_for_each(|cell| persist_shallow(store.as_ref(), cell).map(|_| ()));
            let missing = match stored.and_then(|()| find_missing(store.as_ref(), payload.root())) {
                Ok(missing) => missing,
                Err(e) => {
                    self.reject(&message, data_error_code(&e), &e.to_string());
                    continue;
                }
            };
            if missing.is_empty() {
                beliefs.push((message, belief));
                continue;
            }
            self.request_missing(&message, &missing);
            if attempts < self.config.max_missing_retries {
                self.parked.push(Parked {
                    message,
                    attempts: attempts + 1,
                });
            } else {
                warn!(
                    origin = %message.origin(),
                    missing = missing.len(),
                    "dropping belief with unresolved data"
                );
                self.stats.beliefs_rejected.fetch_add(1, Ordering::Relaxed);
            }
        }
        beliefs
    }

    /// Merge the collected beliefs. Returns `true` if the local belief
    /// changed.
    fn merge_incoming(&mut self, store: &dyn Store, incoming: &[(Message, Belief)]) -> bool {
        let beliefs: Vec<Belief> = incoming.iter().map(|(_, belief)| belief.clone()).collect();
        let batch_error = match self.peer.merge_beliefs(store, &beliefs) {
            Ok(outcome) => {
                self.report_rejected(incoming, &outcome.rejected);
                return outcome.changed;
            }
            Err(e) => e,
        };
        warn!(
            beliefs = incoming.len(),
            error = %batch_error,
            "batch merge failed, merging beliefs one at a time"
        );
        let mut changed = false;
        for (message, belief) in incoming {
            match self.peer.merge_beliefs(store, std::slice::from_ref(belief)) {
                Ok(outcome) => {
                    for rejected in &outcome.rejected {
                        self.reject(message, rejection_code(rejected.reason), &rejected.to_string());
                    }
                    changed |= outcome.changed;
                }
                Err(e) => match consensus_error_code(&e) {
                    Some(code) => self.reject(message, code, &e.to_string()),
                    None => error!(origin = %message.origin(), error = %e, "merge failed"),
                },
            }
        }
        changed
    }

    fn report_rejected(&self, incoming: &[(Message, Belief)], rejected: &[Rejected]) {
        for rejected in rejected {
            match incoming.get(rejected.source) {
                Some((message, _)) => {
                    self.reject(message, rejection_code(rejected.reason), &rejected.to_string());
                }
                None => warn!(source = rejected.source, "rejection for unknown belief"),
            }
        }
    }

    fn reject(&self, message: &Message, code: ErrorCode, detail: &str) {
        warn!(origin = %message.origin(), %code, detail, "rejecting belief message");
        self.stats.beliefs_rejected.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = message.report_error(code, Cell::Nil) {
            debug!(error = %e, "could not report rejection");
        }
    }

    fn request_missing(&self, message: &Message, missing: &[Hash]) {
        for hash in missing.iter().take(MAX_MISSING_REQUESTS) {
            debug!(origin = %message.origin(), %hash, "missing data in belief");
            match message.send_missing_data(*hash) {
                Ok(()) => {
                    self.stats.missing_requests.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(origin = %message.origin(), %hash, error = %e, "unable to request missing data");
                    break;
                }
            }
        }
    }

    fn maybe_broadcast(&mut self, updated: bool) -> PeerResult<()> {
        if self.connections.is_empty() {
            return Ok(());
        }
        let now = Instant::now();
        let since = |t: Option<Instant>| t.map_or(Duration::MAX, |t| now.duration_since(t));
        let spaced = since(self.last_broadcast) > self.config.min_broadcast_spacing();
        if !updated && !spaced {
            return Ok(());
        }
        let full = since(self.last_full_broadcast) >= self.config.rebroadcast_delay();

        let message = self.belief_message(full)?;
        let recipients = self.connections.broadcast(&message);
        self.stats.broadcasts_sent.fetch_add(1, Ordering::Relaxed);
        self.last_broadcast = Some(now);
        if full {
            self.last_full_broadcast = Some(now);
        }
        debug!(recipients, updated, full, bytes = message.data().len(), "belief broadcast");
        Ok(())
    }

    /// Announce the belief and build the message carrying it.
    fn belief_message(&mut self, full: bool) -> PeerResult<Message> {
        let root = self.peer.belief_ref();
        let (announced, novelty) = announce(self.store.as_ref(), &root)?;

        let mut budget = MessageBudget::new(root_length(&announced));
        let mut cells: Vec<Ref> = novelty.into_iter().filter(|r| budget.admit(r)).collect();
        if full {
            if let Some(own) = self.peer.belief().get(self.peer.key()) {
                let mut seen: HashSet<Hash> = cells.iter().map(|r| *r.hash()).collect();
                seen.insert(*announced.hash());
                collect_reachable(self.store.as_ref(), own, &mut seen, &mut budget, &mut cells)?;
            }
        }
        if budget.truncated {
            warn!(cells = cells.len(), "belief message truncated to message limit");
        }

        let message = Message::belief((**self.peer.belief()).clone(), cells);
        let length = message.data().len();
        if length as f64 >= MAX_MESSAGE_LENGTH as f64 * LONG_MESSAGE_FRACTION {
            warn!(length, "long belief delta message");
        }
        self.last_broadcast_belief = Some(*announced.hash());
        Ok(message)
    }
}

fn rejection_code(reason: Rejection) -> ErrorCode {
    match reason {
        Rejection::Malformed => ErrorCode::Format,
        Rejection::WrongSigner | Rejection::BadSignature => ErrorCode::Signature,
    }
}

fn data_error_code(e: &DataError) -> ErrorCode {
    match e {
        DataError::MissingData(_) => ErrorCode::Missing,
        DataError::BadSignature(_) => ErrorCode::Signature,
        DataError::Io(_) => ErrorCode::Load,
        DataError::InvalidData(_) | DataError::BadFormat(_) => ErrorCode::Format,
    }
}

/// The code to send back for a failed merge. `None` if the failure is local.
fn consensus_error_code(e: &ConsensusError) -> Option<ErrorCode> {
    match e {
        ConsensusError::Data(DataError::Io(_)) => None,
        ConsensusError::Data(e) => Some(data_error_code(e)),
        ConsensusError::Execution { .. } => None,
    }
}

/// Every non-embedded cell below `root`, resolved through `store`, until
/// the budget runs out.
fn collect_reachable(
    store: &dyn Store,
    root: &Ref,
    seen: &mut HashSet<Hash>,
    budget: &mut MessageBudget,
    cells: &mut Vec<Ref>,
) -> PeerResult<()> {
    let mut stack = vec![root.clone()];
    while let Some(r) = stack.pop() {
        if r.is_embedded() || !seen.insert(*r.hash()) {
            continue;
        }
        let direct = r.to_direct(store)?;
        if !budget.admit(&direct) {
            break;
        }
        if let Some(value) = direct.direct_value() {
            stack.extend(value.child_refs().into_iter().rev().cloned());
        }
        cells.push(direct);
    }
    Ok(())
}

fn root_length(root: &Ref) -> usize {
    root.direct_value().map_or(0, |c| c.encode().len())
}

/// Running total of message bytes, so attached cells stay within the
/// message limit.
struct MessageBudget {
    used: usize,
    truncated: bool,
}

impl MessageBudget {
    fn new(root_length: usize) -> Self {
        Self {
            used: root_length,
            truncated: false,
        }
    }

    fn admit(&mut self, r: &Ref) -> bool {
        let Some(value) = r.direct_value() else {
            return false;
        };
        // Cell encoding plus its length prefix.
        let cost = value.encode().len() + accord_types::vlc::MAX_VLC_LENGTH;
        if self.used + cost > MAX_MESSAGE_LENGTH {
            self.truncated = true;
            return false;
        }
        self.used += cost;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_consensus::{ConsensusState, HashChainExecutor, NoBlocks};
    use accord_crypto::KeyPair;
    use accord_protocol::{Connection, MessageType, ProtocolResult};
    use accord_store::refs::visit_all_refs;
    use accord_store::{Block, MemoryStore, Order, SignedData, Transaction};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture {
        sent: Mutex<Vec<Message>>,
    }

    impl Connection for Capture {
        fn send(&self, message: Message) -> ProtocolResult<()> {
            self.sent.lock().expect("lock poisoned").push(message);
            Ok(())
        }

        fn remote_key(&self) -> Option<AccountKey> {
            None
        }

        fn is_closed(&self) -> bool {
            false
        }

        fn close(&self) {}
    }

    impl Capture {
        fn take(&self) -> Vec<Message> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    fn fast_config() -> PeerConfig {
        PeerConfig {
            await_beliefs_ms: 5,
            min_broadcast_spacing_ms: 0,
            rebroadcast_delay_ms: 60_000,
            belief_queue_capacity: 4,
            max_missing_retries: 2,
            ..PeerConfig::default()
        }
    }

    struct Setup {
        local: KeyPair,
        remote: KeyPair,
        store: Arc<MemoryStore>,
        connections: Arc<ConnectionManager>,
        propagator: BeliefPropagator,
        queue: BeliefQueue,
        snapshot: watch::Receiver<Arc<PeerSnapshot>>,
    }

    fn setup(config: PeerConfig) -> Setup {
        let local = KeyPair::from_seed([1; 32]);
        let remote = KeyPair::from_seed([2; 32]);
        let genesis = ConsensusState::genesis([(local.account_key(), 1), (remote.account_key(), 1)]);
        let peer = Peer::new(KeyPair::from_seed([1; 32]), genesis, Arc::new(HashChainExecutor));
        let store = Arc::new(MemoryStore::new());
        let connections = Arc::new(ConnectionManager::new());
        let (propagator, queue, snapshot) = BeliefPropagator::new(
            peer,
            store.clone(),
            connections.clone(),
            Arc::new(NoBlocks),
            config,
        );
        Setup {
            local,
            remote,
            store,
            connections,
            propagator,
            queue,
            snapshot,
        }
    }

    /// A block big enough not to be embedded in its order.
    fn big_block(n: i64) -> Block {
        let origin = KeyPair::from_seed([9; 32]).account_key();
        let tx = Ref::new(Cell::Transaction(Transaction::new(
            origin,
            n as u64,
            Cell::blob(&[n as u8; 300]).unwrap(),
        )));
        Block::new(n, vec![tx])
    }

    fn remote_belief(kp: &KeyPair, blocks: Vec<Ref>, pp: usize) -> (Belief, Ref) {
        let order = Order::new(blocks, pp, 0, 1).unwrap();
        let signed = Ref::new(Cell::Signed(SignedData::sign(kp, Cell::Order(order))));
        (Belief::new().with_order(kp.account_key(), signed.clone()), signed)
    }

    /// Everything below `root` that is not embedded, as a sender would attach.
    fn all_cells(root: &Ref) -> Vec<Ref> {
        let mut cells = Vec::new();
        visit_all_refs(root, |r| {
            if !r.is_embedded() {
                cells.push(r.clone());
            }
        });
        cells
    }

    fn received(message: Message, from: Arc<Capture>) -> Message {
        Message::from_data(message.kind(), message.data().clone()).with_connection(from)
    }

    // -----------------------------------------------------------------------
    // Queue
    // -----------------------------------------------------------------------

    #[test]
    fn full_queue_rejects() {
        let s = setup(fast_config());
        for _ in 0..4 {
            s.queue.queue_belief(Message::status(0)).unwrap();
        }
        assert!(matches!(
            s.queue.queue_belief(Message::status(0)),
            Err(PeerError::QueueFull(4))
        ));
    }

    #[tokio::test]
    async fn closed_inbox_is_shutdown() {
        let s = setup(fast_config());
        let mut propagator = s.propagator;
        drop(s.queue);
        assert!(matches!(propagator.step().await, Err(PeerError::Shutdown)));
    }

    // -----------------------------------------------------------------------
    // Merging
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn merges_complete_belief() {
        let mut s = setup(fast_config());
        let block = Ref::new(Cell::Block(big_block(1)));
        let (belief, signed) = remote_belief(&s.remote, vec![block], 0);
        let sender = Arc::new(Capture::default());
        let message = received(Message::belief(belief, all_cells(&signed)), sender.clone());

        s.queue.queue_belief(message).unwrap();
        assert!(s.propagator.step().await.unwrap());

        let snap = s.snapshot.borrow().clone();
        assert_eq!(snap.order_length, 1);
        assert_eq!(snap.proposal_point, 1);
        assert_eq!(snap.beliefs_received, 1);
        assert!(sender.take().is_empty());
    }

    #[tokio::test]
    async fn missing_data_is_requested_then_merged() {
        let mut s = setup(fast_config());
        let block = Ref::new(Cell::Block(big_block(2)));
        let (belief, signed) = remote_belief(&s.remote, vec![block.clone()], 0);
        let sender = Arc::new(Capture::default());

        // Send everything except the block itself.
        let partial: Vec<Ref> = all_cells(&signed)
            .into_iter()
            .filter(|r| r.hash() != block.hash())
            .collect();
        s.queue
            .queue_belief(received(Message::belief(belief, partial), sender.clone()))
            .unwrap();
        assert!(!s.propagator.step().await.unwrap());

        let requests = sender.take();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].kind(), MessageType::MissingData);
        assert_eq!(requests[0].requested_hash().unwrap(), *block.hash());
        assert_eq!(s.propagator.stats().missing_requests(), 1);

        // The data arrives through the store; the parked belief is retried.
        persist_shallow(s.store.as_ref(), &block).unwrap();
        assert!(s.propagator.step().await.unwrap());
        assert_eq!(s.propagator.peer().own_order().len(), 1);
        assert_eq!(s.propagator.stats().beliefs_received(), 1);
    }

    #[tokio::test]
    async fn unresolved_belief_is_dropped_after_retries() {
        let mut s = setup(fast_config());
        let block = Ref::new(Cell::Block(big_block(3)));
        let (belief, _) = remote_belief(&s.remote, vec![block], 0);
        let sender = Arc::new(Capture::default());
        s.queue
            .queue_belief(received(Message::belief(belief, Vec::new()), sender.clone()))
            .unwrap();
        for _ in 0..4 {
            s.propagator.step().await.unwrap();
        }
        assert_eq!(s.propagator.stats().beliefs_rejected(), 1);
        assert!(s.propagator.parked.is_empty());
    }

    #[tokio::test]
    async fn corrupt_message_reports_format_error() {
        let mut s = setup(fast_config());
        let sender = Arc::new(Capture::default());
        let bad = Message::from_data(MessageType::Belief, bytes_of(&[0xFF, 0x01]))
            .with_connection(sender.clone());
        s.queue.queue_belief(bad).unwrap();
        s.propagator.step().await.unwrap();

        let replies = sender.take();
        assert_eq!(replies.len(), 1);
        let record = replies[0].result_record().unwrap();
        assert_eq!(record.error, Some(ErrorCode::Format));
        assert_eq!(s.propagator.stats().beliefs_rejected(), 1);
    }

    #[tokio::test]
    async fn forged_order_reports_signature_error() {
        let mut s = setup(fast_config());
        let imposter = KeyPair::from_seed([66; 32]);
        let block = Ref::new(Cell::Block(big_block(6)));
        let (_, genuine) = remote_belief(&imposter, vec![block], 0);
        let cell = genuine.direct_value().unwrap();
        let signed = cell.as_signed().unwrap();
        // The imposter's signature filed under the remote key.
        let forged = Ref::new(Cell::Signed(SignedData::from_parts(
            s.remote.account_key(),
            *signed.signature(),
            signed.value_ref().clone(),
        )));
        let belief = Belief::new().with_order(s.remote.account_key(), forged.clone());
        let sender = Arc::new(Capture::default());
        s.queue
            .queue_belief(received(Message::belief(belief, all_cells(&forged)), sender.clone()))
            .unwrap();
        s.propagator.step().await.unwrap();

        let replies = sender.take();
        assert_eq!(replies.len(), 1);
        let record = replies[0].result_record().unwrap();
        assert_eq!(record.error, Some(ErrorCode::Signature));
        assert_eq!(s.propagator.stats().beliefs_rejected(), 1);
        assert!(s.propagator.peer().belief().get(&s.remote.account_key()).is_none());
    }

    #[tokio::test]
    async fn non_block_order_reports_format_error() {
        let mut s = setup(fast_config());
        let order = Order::new(vec![Ref::new(Cell::Long(3))], 0, 0, 1).unwrap();
        let signed = Ref::new(Cell::Signed(SignedData::sign(&s.remote, Cell::Order(order))));
        let belief = Belief::new().with_order(s.remote.account_key(), signed.clone());
        let sender = Arc::new(Capture::default());
        s.queue
            .queue_belief(received(Message::belief(belief, all_cells(&signed)), sender.clone()))
            .unwrap();
        s.propagator.step().await.unwrap();

        let replies = sender.take();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].result_record().unwrap().error, Some(ErrorCode::Format));
        assert!(s.propagator.peer().own_order().is_empty());
    }

    #[tokio::test]
    async fn bad_belief_does_not_stop_good_one() {
        let s = setup(fast_config());
        let mut snapshot = s.snapshot.clone();

        let order = Order::new(vec![Ref::new(Cell::Long(3))], 0, 0, 1).unwrap();
        let bad_order = Ref::new(Cell::Signed(SignedData::sign(&s.remote, Cell::Order(order))));
        let bad = Belief::new().with_order(s.remote.account_key(), bad_order.clone());
        let block = Ref::new(Cell::Block(big_block(7)));
        let (good, signed) = remote_belief(&s.remote, vec![block], 0);

        let bad_sender = Arc::new(Capture::default());
        let good_sender = Arc::new(Capture::default());
        let corrupt = Message::from_data(MessageType::Belief, bytes_of(&[0xFF, 0x01]))
            .with_connection(bad_sender.clone());
        s.queue.queue_belief(corrupt).unwrap();
        s.queue
            .queue_belief(received(Message::belief(bad, all_cells(&bad_order)), bad_sender.clone()))
            .unwrap();
        s.queue
            .queue_belief(received(Message::belief(good, all_cells(&signed)), good_sender.clone()))
            .unwrap();

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(s.propagator.run(stop_rx));
        tokio::time::timeout(
            Duration::from_secs(5),
            snapshot.wait_for(|snap| snap.order_length == 1),
        )
        .await
        .expect("good belief merged")
        .unwrap();
        assert!(!task.is_finished());

        let codes: Vec<Option<ErrorCode>> = bad_sender
            .take()
            .iter()
            .map(|m| m.result_record().unwrap().error)
            .collect();
        assert_eq!(codes, vec![Some(ErrorCode::Format), Some(ErrorCode::Format)]);
        assert!(good_sender.take().is_empty());

        stop.send(true).unwrap();
        let peer = task.await.unwrap().unwrap();
        assert_eq!(peer.own_order().len(), 1);
    }

    fn bytes_of(data: &'static [u8]) -> bytes::Bytes {
        bytes::Bytes::from_static(data)
    }

    // -----------------------------------------------------------------------
    // Broadcast
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn broadcasts_own_novelty_once() {
        let mut s = setup(fast_config());
        let out = Arc::new(Capture::default());
        s.connections.add(s.remote.account_key(), out.clone());

        let block = Ref::new(Cell::Block(big_block(4)));
        let (belief, signed) = remote_belief(&s.remote, vec![block.clone()], 0);
        s.queue
            .queue_belief(Message::belief(belief, all_cells(&signed)))
            .unwrap();
        s.propagator.step().await.unwrap();

        let sent = out.take();
        assert_eq!(sent.len(), 1);
        let payload = sent[0].payload().unwrap();
        let belief = payload.value().as_belief().unwrap();
        let own = belief.get(&s.local.account_key()).unwrap();
        assert!(payload.cells().contains(own));
        // Cells that arrived from the remote peer are not novel here.
        assert!(!payload.cells().contains(&block));
        assert_eq!(s.propagator.stats().broadcasts_sent(), 1);

        // Nothing new: the next broadcast carries no cells.
        s.propagator.step().await.unwrap();
        let sent = out.take();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].payload().unwrap().cells().is_empty());
    }

    #[tokio::test]
    async fn full_rebroadcast_carries_order_cells() {
        let mut config = fast_config();
        config.rebroadcast_delay_ms = 0;
        let mut s = setup(config);
        let out = Arc::new(Capture::default());
        s.connections.add(s.remote.account_key(), out.clone());

        let block = Ref::new(Cell::Block(big_block(5)));
        let (belief, signed) = remote_belief(&s.remote, vec![block.clone()], 0);
        s.queue
            .queue_belief(Message::belief(belief, all_cells(&signed)))
            .unwrap();
        s.propagator.step().await.unwrap();
        out.take();

        s.propagator.step().await.unwrap();
        let sent = out.take();
        assert!(sent[0].payload().unwrap().cells().contains(&block));
    }

    #[tokio::test]
    async fn no_broadcast_without_connections() {
        let mut s = setup(fast_config());
        s.propagator.step().await.unwrap();
        assert_eq!(s.propagator.stats().broadcasts_sent(), 0);
    }

    #[tokio::test]
    async fn belief_is_persisted_each_iteration() {
        let mut s = setup(fast_config());
        s.propagator.step().await.unwrap();
        let root = s.propagator.peer().belief_ref();
        assert!(s.store.status_of(root.hash()).unwrap() >= accord_store::RefStatus::Persisted);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let s = setup(fast_config());
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(s.propagator.run(stop_rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.send(true).unwrap();
        let peer = task.await.unwrap().unwrap();
        assert_eq!(peer.key(), &s.local.account_key());
    }
}
