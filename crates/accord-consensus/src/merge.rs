//! Belief merge.
//!
//! A merge folds remote orders into the local belief, then re-derives the
//! local peer's own order from everything it now knows:
//!
//! 1. Per remote peer, the incoming order replaces the held one only if it
//!    ranks higher (timestamp, consensus point, proposal point, length, hash).
//! 2. Starting from the local final prefix, the block supported by the most
//!    stake wins each position, ties to the lowest hash. The local stake only
//!    backs blocks the local peer proposed itself, so blocks adopted by an
//!    earlier merge carry no extra weight. Locally proposed blocks the
//!    winning sequence lacks are appended after it.
//! 3. The proposal point is the longest prefix of the new sequence shared by
//!    more than the threshold of stake. The consensus point is the longest
//!    prefix that more than the threshold of stake has itself proposed. The
//!    consensus point never decreases.
//!
//! Given the same context and inputs, a merge always produces the same
//! belief.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use accord_crypto::KeyPair;
use accord_store::{Belief, Cell, DataError, DataResult, Order, Ref, SignedData, Store};
use accord_types::{AccountKey, Hash};
use tracing::{debug, warn};

use crate::state::{ConsensusState, Threshold};

/// Parameters for one merge.
pub struct MergeContext<'a> {
    key_pair: &'a KeyPair,
    key: AccountKey,
    timestamp: i64,
    state: &'a ConsensusState,
    store: &'a dyn Store,
    threshold: Threshold,
    proposed: Option<&'a HashSet<Hash>>,
}

impl<'a> MergeContext<'a> {
    pub fn new(
        key_pair: &'a KeyPair,
        timestamp: i64,
        state: &'a ConsensusState,
        store: &'a dyn Store,
    ) -> Self {
        Self {
            key_pair,
            key: key_pair.account_key(),
            timestamp,
            state,
            store,
            threshold: Threshold::default(),
            proposed: None,
        }
    }

    pub fn with_threshold(mut self, threshold: Threshold) -> Self {
        self.threshold = threshold;
        self
    }

    /// Hashes of the blocks the local peer proposed that are not yet final.
    pub fn with_proposed(mut self, proposed: &'a HashSet<Hash>) -> Self {
        self.proposed = Some(proposed);
        self
    }

    fn is_proposed(&self, block: &Ref) -> bool {
        self.proposed.is_some_and(|p| p.contains(block.hash()))
    }

    /// The local peer's key.
    pub fn key(&self) -> &AccountKey {
        &self.key
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn state(&self) -> &ConsensusState {
        self.state
    }

    pub fn store(&self) -> &dyn Store {
        self.store
    }
}

/// Resolve a belief entry into its signed wrapper and the order it signs.
pub fn resolve_order(store: &dyn Store, signed_ref: &Ref) -> DataResult<(SignedData, Order)> {
    let cell = signed_ref.value(store)?;
    let signed = cell
        .as_signed()
        .ok_or_else(|| DataError::InvalidData(format!("belief entry is a {}", cell.type_name())))?
        .clone();
    let value = signed.value(store)?;
    let order = value
        .as_order()
        .ok_or_else(|| DataError::InvalidData(format!("signed {} in belief", value.type_name())))?
        .clone();
    Ok((signed, order))
}

/// The local peer's current order in `belief`, if it has one.
pub fn own_order(store: &dyn Store, belief: &Belief, key: &AccountKey) -> DataResult<Option<Order>> {
    belief
        .get(key)
        .map(|r| resolve_order(store, r).map(|(_, order)| order))
        .transpose()
}

/// Total order over competing versions of one peer's order.
pub fn compare_orders(a: &Order, a_hash: &Hash, b: &Order, b_hash: &Hash) -> Ordering {
    a.timestamp()
        .cmp(&b.timestamp())
        .then(a.consensus_point().cmp(&b.consensus_point()))
        .then(a.proposal_point().cmp(&b.proposal_point()))
        .then(a.len().cmp(&b.len()))
        .then(a_hash.cmp(b_hash))
}

/// Why a remote order was discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    /// Not a signed order, or an order naming something other than blocks.
    #[error("malformed order")]
    Malformed,
    /// Signed by a key other than the one it is filed under.
    #[error("order signed by another key")]
    WrongSigner,
    /// The signature does not verify.
    #[error("bad order signature")]
    BadSignature,
}

/// A discarded order and the index of the incoming belief carrying it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejected {
    pub source: usize,
    pub key: AccountKey,
    pub reason: Rejection,
}

impl std::fmt::Display for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} for {}", self.reason, self.key)
    }
}

/// Result of [`merge_checked`].
#[derive(Debug)]
pub struct Merged {
    pub belief: Arc<Belief>,
    pub rejected: Vec<Rejected>,
}

/// Wrap `order` in a signature by the local peer.
pub fn sign_order(key_pair: &KeyPair, order: Order) -> Ref {
    Ref::new(Cell::Signed(SignedData::sign(key_pair, Cell::Order(order))))
}

/// Fold `incoming` beliefs into `belief`, dropping rejections.
pub fn merge(
    ctx: &MergeContext<'_>,
    belief: &Arc<Belief>,
    incoming: &[Belief],
) -> DataResult<Arc<Belief>> {
    merge_checked(ctx, belief, incoming).map(|merged| merged.belief)
}

/// Fold `incoming` beliefs into `belief`.
///
/// The merged belief is the same `Arc` if nothing changed. Orders that are
/// malformed or fail verification are discarded, logged and listed in
/// [`Merged::rejected`] against the incoming belief that carried them.
/// A referenced cell that cannot be resolved fails the whole merge with
/// [`DataError::MissingData`] and nothing is applied.
pub fn merge_checked(
    ctx: &MergeContext<'_>,
    belief: &Arc<Belief>,
    incoming: &[Belief],
) -> DataResult<Merged> {
    let mut entries: BTreeMap<AccountKey, Ref> = belief.orders().clone();
    let mut resolved: BTreeMap<AccountKey, Order> = BTreeMap::new();
    let mut rejected = Vec::new();
    let mut changed = false;

    for (source, delta) in incoming.iter().enumerate() {
        for (key, candidate) in delta.orders() {
            if key == &ctx.key {
                continue;
            }
            if ctx.state.stake_of(key) == 0 {
                debug!(peer = %key, "ignoring order from unstaked peer");
                continue;
            }
            if entries.get(key) == Some(candidate) {
                continue;
            }
            let held = match entries.get(key) {
                Some(current) => Some((cached_order(ctx.store, &mut resolved, key, current)?, current)),
                None => None,
            };
            let order = match verified_order(ctx.store, key, candidate, held.map(|(order, _)| order))? {
                Ok(order) => order,
                Err(reason) => {
                    rejected.push(Rejected {
                        source,
                        key: *key,
                        reason,
                    });
                    continue;
                }
            };
            let replace = match held {
                None => true,
                Some((held, current)) => {
                    compare_orders(&order, candidate.hash(), held, current.hash())
                        == Ordering::Greater
                }
            };
            if replace {
                debug!(peer = %key, blocks = order.len(), "accepted newer order");
                entries.insert(*key, candidate.clone());
                resolved.insert(*key, order);
                changed = true;
            }
        }
    }

    if let Some(own) = derive_own_order(ctx, &entries, &mut resolved)? {
        entries.insert(ctx.key, sign_order(ctx.key_pair, own));
        changed = true;
    }

    let belief = if changed {
        Arc::new(Belief::from_orders(entries))
    } else {
        Arc::clone(belief)
    };
    Ok(Merged { belief, rejected })
}

/// Append `block` to the local order and re-sign it.
pub fn propose_block(
    ctx: &MergeContext<'_>,
    belief: &Arc<Belief>,
    block: Ref,
) -> DataResult<Arc<Belief>> {
    let own = own_order(ctx.store, belief, &ctx.key)?.unwrap_or_else(|| Order::empty(ctx.timestamp));
    let timestamp = ctx.timestamp.max(own.timestamp());
    let next = own.append(block, timestamp);
    debug!(length = next.len(), "proposed block");
    Ok(Arc::new(
        belief.with_order(ctx.key, sign_order(ctx.key_pair, next)),
    ))
}

/// Resolve and check a remote entry. Blocks beyond the prefix shared with
/// the `held` order must resolve to blocks. Only missing data is an error;
/// anything else wrong with the entry is a [`Rejection`].
fn verified_order(
    store: &dyn Store,
    key: &AccountKey,
    candidate: &Ref,
    held: Option<&Order>,
) -> DataResult<Result<Order, Rejection>> {
    let (signed, order) = match resolve_order(store, candidate) {
        Ok(resolved) => resolved,
        Err(e @ DataError::MissingData(_)) => return Err(e),
        Err(e) => {
            warn!(peer = %key, error = %e, "discarding malformed order");
            return Ok(Err(Rejection::Malformed));
        }
    };
    if signed.key() != key {
        warn!(peer = %key, signer = %signed.key(), "discarding order signed by another key");
        return Ok(Err(Rejection::WrongSigner));
    }
    if let Err(e) = signed.check_signature() {
        warn!(peer = %key, error = %e, "discarding order with bad signature");
        return Ok(Err(Rejection::BadSignature));
    }
    let checked = held.map_or(0, |held| held.common_prefix_len(&order));
    for (index, block) in order.blocks().iter().enumerate().skip(checked) {
        let cell = match block.value(store) {
            Ok(cell) => cell,
            Err(e @ DataError::MissingData(_)) => return Err(e),
            Err(e) => {
                warn!(peer = %key, index, error = %e, "discarding order with unreadable block");
                return Ok(Err(Rejection::Malformed));
            }
        };
        if cell.as_block().is_none() {
            warn!(peer = %key, index, found = cell.type_name(), "discarding order with non-block entry");
            return Ok(Err(Rejection::Malformed));
        }
    }
    Ok(Ok(order))
}

fn cached_order<'c>(
    store: &dyn Store,
    cache: &'c mut BTreeMap<AccountKey, Order>,
    key: &AccountKey,
    signed_ref: &Ref,
) -> DataResult<&'c Order> {
    if !cache.contains_key(key) {
        let (_, order) = resolve_order(store, signed_ref)?;
        cache.insert(*key, order);
    }
    cache
        .get(key)
        .ok_or_else(|| DataError::InvalidData(format!("order cache lost {key}")))
}

/// Recompute the local order. Returns `None` if it is unchanged.
fn derive_own_order(
    ctx: &MergeContext<'_>,
    entries: &BTreeMap<AccountKey, Ref>,
    resolved: &mut BTreeMap<AccountKey, Order>,
) -> DataResult<Option<Order>> {
    let (own, held) = match entries.get(&ctx.key) {
        Some(r) => (cached_order(ctx.store, resolved, &ctx.key, r)?.clone(), true),
        None => (Order::empty(ctx.timestamp), false),
    };

    let mut remote: Vec<(u64, Order)> = Vec::new();
    for (key, stake) in ctx.state.stakes() {
        if key == &ctx.key {
            continue;
        }
        if let Some(r) = entries.get(key) {
            remote.push((*stake, cached_order(ctx.store, resolved, key, r)?.clone()));
        }
    }
    let own_stake = ctx.state.stake_of(&ctx.key);
    let total = ctx.state.total_stake();

    let blocks = winning_blocks(ctx, &own, own_stake, &remote);
    let candidate = Order::new(blocks.clone(), 0, 0, own.timestamp())?;

    let mut agreement: Vec<(usize, u64)> = remote
        .iter()
        .map(|(stake, order)| (order.common_prefix_len(&candidate), *stake))
        .collect();
    agreement.push((candidate.len(), own_stake));
    let proposal = threshold_point(agreement, total, ctx.threshold);

    let mut proposed: Vec<(usize, u64)> = remote
        .iter()
        .map(|(stake, order)| {
            let shared = order.common_prefix_len(&candidate);
            (order.proposal_point().min(shared), *stake)
        })
        .collect();
    proposed.push((proposal, own_stake));
    let consensus = threshold_point(proposed, total, ctx.threshold).max(own.consensus_point());
    let proposal = proposal.max(consensus);

    if held
        && blocks == own.blocks()
        && proposal == own.proposal_point()
        && consensus == own.consensus_point()
    {
        return Ok(None);
    }
    if consensus > own.consensus_point() {
        debug!(
            from = own.consensus_point(),
            to = consensus,
            "consensus point advanced"
        );
    }
    let timestamp = ctx.timestamp.max(own.timestamp());
    Order::new(blocks, proposal, consensus, timestamp).map(Some)
}

/// Stake-weighted walk from the local final prefix.
fn winning_blocks(
    ctx: &MergeContext<'_>,
    own: &Order,
    own_stake: u64,
    remote: &[(u64, Order)],
) -> Vec<Ref> {
    let fixed = own.consensus_point();
    let mut blocks: Vec<Ref> = own.blocks()[..fixed].to_vec();

    let mut candidates: Vec<(u64, &Order)> = remote
        .iter()
        .filter(|(_, order)| order.agrees_with(own, fixed))
        .map(|(stake, order)| (*stake, order))
        .collect();
    let mut own_agrees = true;

    let mut position = fixed;
    loop {
        let mut tally: BTreeMap<&Ref, u64> = BTreeMap::new();
        for (stake, order) in &candidates {
            if let Some(block) = order.block(position) {
                *tally.entry(block).or_default() += stake;
            }
        }
        if own_agrees {
            if let Some(block) = own.block(position).filter(|b| ctx.is_proposed(b)) {
                *tally.entry(block).or_default() += own_stake;
            }
        }
        // Most stake, then lowest hash.
        let Some(winner) = tally
            .into_iter()
            .max_by_key(|(block, stake)| (*stake, Reverse(*block)))
            .map(|(block, _)| block.clone())
        else {
            break;
        };
        candidates.retain(|(_, order)| order.block(position) == Some(&winner));
        own_agrees = own_agrees && own.block(position) == Some(&winner);
        blocks.push(winner);
        position += 1;
    }

    let included: HashSet<Hash> = blocks.iter().map(|b| *b.hash()).collect();
    for block in own.blocks() {
        if ctx.is_proposed(block) && !included.contains(block.hash()) {
            blocks.push(block.clone());
        }
    }
    blocks
}

/// Largest `k` such that the stake of votes reaching at least `k` exceeds
/// the threshold. Zero if no prefix qualifies.
fn threshold_point(mut votes: Vec<(usize, u64)>, total: u64, threshold: Threshold) -> usize {
    votes.sort_by(|a, b| b.0.cmp(&a.0));
    let mut accumulated = 0u64;
    for (point, stake) in votes {
        accumulated = accumulated.saturating_add(stake);
        if threshold.is_exceeded(accumulated, total) {
            return point;
        }
    }
    0
}
