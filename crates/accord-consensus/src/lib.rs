//! Convergent Belief merge for Accord.
//!
//! Each peer holds a [`Belief`](accord_store::Belief): the latest signed
//! order of every peer it knows. Merging beliefs is deterministic, so peers
//! that have seen the same orders compute the same result, and repeated
//! gossip drives every honest peer to one agreed block sequence.
//!
//! # Key Types
//!
//! - [`merge()`] / [`propose_block`] -- pure belief transitions under a [`MergeContext`]
//! - [`Peer`] -- one peer's belief plus the state of its final blocks
//! - [`ConsensusState`] / [`Threshold`] -- stake table and agreement fraction
//! - [`BlockExecutor`] / [`BlockProducer`] -- hooks for applying and creating blocks

pub mod error;
pub mod executor;
pub mod merge;
pub mod peer;
pub mod state;

pub use error::{ConsensusError, ConsensusResult};
pub use executor::{BlockExecutor, BlockProducer, HashChainExecutor, NoBlocks, PeerView};
pub use merge::{
    compare_orders, merge, merge_checked, own_order, propose_block, resolve_order, sign_order,
    MergeContext, Merged, Rejected, Rejection,
};
pub use peer::{MergeOutcome, Peer};
pub use state::{ConsensusState, Threshold};
