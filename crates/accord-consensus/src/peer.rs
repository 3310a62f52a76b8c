use std::collections::HashSet;
use std::sync::Arc;

use accord_crypto::KeyPair;
use accord_store::{Belief, Block, Cell, DataError, Order, Ref, Store};
use accord_types::{AccountKey, Hash};
use tracing::{debug, info};

use crate::error::{ConsensusError, ConsensusResult};
use crate::executor::{BlockExecutor, PeerView};
use crate::merge::{self, MergeContext, Rejected};
use crate::state::{ConsensusState, Threshold};

/// Consensus state of one peer.
///
/// Holds the current belief, the local order cached out of it, and the
/// state produced by applying every final block so far. All mutation goes
/// through [`merge_beliefs`](Self::merge_beliefs) and
/// [`propose_block`](Self::propose_block), which re-sign the local order and
/// then apply newly final blocks. A transition whose blocks cannot be
/// applied leaves the peer as it was.
pub struct Peer {
    key_pair: KeyPair,
    key: AccountKey,
    belief: Arc<Belief>,
    own: Order,
    /// Blocks proposed here that are not final yet.
    proposed: HashSet<Hash>,
    genesis: ConsensusState,
    state: ConsensusState,
    executed: usize,
    timestamp: i64,
    threshold: Threshold,
    executor: Arc<dyn BlockExecutor>,
}

impl Peer {
    /// A peer with an empty signed order of its own and no other knowledge.
    pub fn new(
        key_pair: KeyPair,
        genesis: ConsensusState,
        executor: Arc<dyn BlockExecutor>,
    ) -> Self {
        let key = key_pair.account_key();
        let own = Order::empty(0);
        let belief = Arc::new(
            Belief::new().with_order(key, merge::sign_order(&key_pair, own.clone())),
        );
        Self {
            key_pair,
            key,
            belief,
            own,
            proposed: HashSet::new(),
            state: genesis.clone(),
            genesis,
            executed: 0,
            timestamp: 0,
            threshold: Threshold::default(),
            executor,
        }
    }

    pub fn with_threshold(mut self, threshold: Threshold) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn key(&self) -> &AccountKey {
        &self.key
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn belief(&self) -> &Arc<Belief> {
        &self.belief
    }

    /// The belief as a cell ref, ready to persist or broadcast.
    pub fn belief_ref(&self) -> Ref {
        Ref::new(Cell::Belief((*self.belief).clone()))
    }

    pub fn own_order(&self) -> &Order {
        &self.own
    }

    pub fn genesis(&self) -> &ConsensusState {
        &self.genesis
    }

    /// State after applying every block up to the consensus point.
    pub fn state(&self) -> &ConsensusState {
        &self.state
    }

    pub fn consensus_point(&self) -> usize {
        self.own.consensus_point()
    }

    pub fn proposal_point(&self) -> usize {
        self.own.proposal_point()
    }

    /// Number of final blocks applied to the state.
    pub fn executed_count(&self) -> usize {
        self.executed
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Advance the peer clock. Timestamps never go backwards.
    pub fn set_timestamp(&mut self, timestamp: i64) {
        self.timestamp = self.timestamp.max(timestamp);
    }

    /// What a block producer sees of this peer.
    pub fn view(&self) -> PeerView<'_> {
        PeerView {
            key: self.key,
            key_pair: &self.key_pair,
            timestamp: self.timestamp,
            state: &self.state,
            order: &self.own,
        }
    }

    /// Merge remote beliefs.
    ///
    /// On error nothing is applied; a [`DataError::MissingData`] names the
    /// cell to fetch before retrying. Orders discarded as malformed or badly
    /// signed are listed in the outcome against the belief that carried them.
    pub fn merge_beliefs(
        &mut self,
        store: &dyn Store,
        incoming: &[Belief],
    ) -> ConsensusResult<MergeOutcome> {
        let ctx = self.context(store);
        let merged = merge::merge_checked(&ctx, &self.belief, incoming)?;
        let changed = !Arc::ptr_eq(&merged.belief, &self.belief);
        if changed {
            self.install(store, merged.belief)?;
        }
        Ok(MergeOutcome {
            changed,
            rejected: merged.rejected,
        })
    }

    /// Append a new block to the local order. Returns the block's ref.
    pub fn propose_block(&mut self, store: &dyn Store, block: Block) -> ConsensusResult<Ref> {
        let block_ref = Ref::new(Cell::Block(block));
        let next = merge::propose_block(&self.context(store), &self.belief, block_ref.clone())?;
        self.install(store, next)?;
        self.proposed.insert(*block_ref.hash());
        Ok(block_ref)
    }

    fn context<'a>(&'a self, store: &'a dyn Store) -> MergeContext<'a> {
        MergeContext::new(&self.key_pair, self.timestamp, &self.state, store)
            .with_threshold(self.threshold)
            .with_proposed(&self.proposed)
    }

    /// Switch to `belief` once its newly final blocks have been applied.
    fn install(&mut self, store: &dyn Store, belief: Arc<Belief>) -> ConsensusResult<()> {
        let own = merge::own_order(store, &belief, &self.key)?.ok_or_else(|| {
            DataError::InvalidData(format!("belief lost own order for {}", self.key))
        })?;
        let executed = self.execute(store, &own)?;
        self.belief = belief;
        self.own = own;
        if let Some((state, executed)) = executed {
            self.commit(state, executed);
        }
        Ok(())
    }

    /// Apply blocks between the last executed one and the consensus point.
    /// Returns the number applied.
    pub fn update_state(&mut self, store: &dyn Store) -> ConsensusResult<usize> {
        let start = self.executed;
        if let Some((state, executed)) = self.execute(store, &self.own)? {
            self.commit(state, executed);
        }
        Ok(self.executed - start)
    }

    /// The state after applying the final blocks of `own` not yet executed,
    /// or `None` if there are none.
    fn execute(
        &self,
        store: &dyn Store,
        own: &Order,
    ) -> ConsensusResult<Option<(ConsensusState, usize)>> {
        let target = own.consensus_point();
        if self.executed >= target {
            return Ok(None);
        }
        let mut state = self.state.clone();
        for index in self.executed..target {
            let block_ref = &own.blocks()[index];
            let cell = block_ref.value(store)?;
            let block = cell.as_block().ok_or_else(|| ConsensusError::Execution {
                index,
                reason: format!("expected block, found {}", cell.type_name()),
            })?;
            state = self
                .executor
                .apply_block(&state, block_ref, block)
                .map_err(|reason| ConsensusError::Execution { index, reason })?;
            debug!(index, block = %block_ref.hash().short_hex(), "applied block");
        }
        Ok(Some((state, target)))
    }

    fn commit(&mut self, state: ConsensusState, executed: usize) {
        for block in &self.own.blocks()[self.executed..executed] {
            self.proposed.remove(block.hash());
        }
        let applied = executed - self.executed;
        self.state = state;
        self.executed = executed;
        info!(
            consensus_point = executed,
            applied,
            state = %self.state.state_hash.short_hex(),
            "consensus advanced"
        );
    }
}

/// What a call to [`Peer::merge_beliefs`] did.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// The belief changed.
    pub changed: bool,
    /// Remote orders that were discarded.
    pub rejected: Vec<Rejected>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("key", &self.key)
            .field("blocks", &self.own.len())
            .field("proposal_point", &self.own.proposal_point())
            .field("consensus_point", &self.own.consensus_point())
            .field("executed", &self.executed)
            .finish()
    }
}
