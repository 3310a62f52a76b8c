use accord_crypto::KeyPair;
use accord_store::{Block, Order, Ref};
use accord_types::{AccountKey, Hash};

use crate::state::ConsensusState;

/// Applies finalized blocks to the consensus state.
///
/// Called once per block, in order, after the block is final. The result
/// becomes the state against which later merges are weighted.
pub trait BlockExecutor: Send + Sync {
    fn apply_block(
        &self,
        state: &ConsensusState,
        block_ref: &Ref,
        block: &Block,
    ) -> Result<ConsensusState, String>;
}

/// Executor that only folds block hashes into `state_hash`, leaving stakes
/// unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct HashChainExecutor;

impl BlockExecutor for HashChainExecutor {
    fn apply_block(
        &self,
        state: &ConsensusState,
        block_ref: &Ref,
        _block: &Block,
    ) -> Result<ConsensusState, String> {
        let mut input = Vec::with_capacity(2 * Hash::LENGTH);
        input.extend_from_slice(state.state_hash.as_bytes());
        input.extend_from_slice(block_ref.hash().as_bytes());
        let mut next = state.clone();
        next.block_count += 1;
        next.state_hash = Hash::compute(&input);
        Ok(next)
    }
}

/// What a [`BlockProducer`] may consult when deciding to propose.
pub struct PeerView<'a> {
    pub key: AccountKey,
    pub key_pair: &'a KeyPair,
    pub timestamp: i64,
    pub state: &'a ConsensusState,
    pub order: &'a Order,
}

/// Source of new blocks for the local peer.
pub trait BlockProducer: Send + Sync {
    /// A block to append to the local order now, if there is one.
    fn maybe_generate_block(&self, view: &PeerView<'_>) -> Option<Block>;
}

/// Producer that never proposes. Used by observer peers.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoBlocks;

impl BlockProducer for NoBlocks {
    fn maybe_generate_block(&self, _view: &PeerView<'_>) -> Option<Block> {
        None
    }
}
