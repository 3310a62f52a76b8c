//! Ledger records: transactions, blocks, orders and beliefs.
//!
//! These are plain immutable values. Every update returns a new value; the
//! consensus layer decides which values replace which.

use std::collections::BTreeMap;

use accord_types::AccountKey;

use crate::cell::Cell;
use crate::error::{DataError, DataResult};
use crate::reference::Ref;

/// A client transaction. The payload is opaque to consensus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    /// Account that originated the transaction.
    pub origin: AccountKey,
    /// Per-origin sequence number.
    pub sequence: u64,
    /// Opaque operation data.
    pub payload: Ref,
}

impl Transaction {
    pub fn new(origin: AccountKey, sequence: u64, payload: Cell) -> Self {
        Self {
            origin,
            sequence,
            payload: Ref::new(payload),
        }
    }
}

/// An ordered batch of signed transactions proposed together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    /// Proposer's wall-clock time in milliseconds.
    pub timestamp: i64,
    /// Refs to `Cell::Signed` transactions, in execution order.
    pub transactions: Vec<Ref>,
}

impl Block {
    pub fn new(timestamp: i64, transactions: Vec<Ref>) -> Self {
        Self {
            timestamp,
            transactions,
        }
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

/// One peer's proposed sequence of blocks.
///
/// Two prefixes are tracked. The proposal point is how far the peer believes
/// a threshold of stake already agrees. The consensus point is how far a
/// threshold of stake has itself proposed, and is final. Always
/// `consensus_point <= proposal_point <= len`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Order {
    blocks: Vec<Ref>,
    proposal_point: usize,
    consensus_point: usize,
    timestamp: i64,
}

impl Order {
    /// Create an order, checking the point invariants.
    pub fn new(
        blocks: Vec<Ref>,
        proposal_point: usize,
        consensus_point: usize,
        timestamp: i64,
    ) -> DataResult<Self> {
        let order = Self {
            blocks,
            proposal_point,
            consensus_point,
            timestamp,
        };
        order.validate()?;
        Ok(order)
    }

    /// An order with no blocks.
    pub fn empty(timestamp: i64) -> Self {
        Self {
            blocks: Vec::new(),
            proposal_point: 0,
            consensus_point: 0,
            timestamp,
        }
    }

    pub fn validate(&self) -> DataResult<()> {
        if self.consensus_point > self.proposal_point || self.proposal_point > self.blocks.len() {
            return Err(DataError::InvalidData(format!(
                "order points out of range: consensus {} proposal {} length {}",
                self.consensus_point,
                self.proposal_point,
                self.blocks.len()
            )));
        }
        Ok(())
    }

    pub fn blocks(&self) -> &[Ref] {
        &self.blocks
    }

    pub fn block(&self, index: usize) -> Option<&Ref> {
        self.blocks.get(index)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn proposal_point(&self) -> usize {
        self.proposal_point
    }

    pub fn consensus_point(&self) -> usize {
        self.consensus_point
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// A copy with one more block at the end.
    pub fn append(&self, block: Ref, timestamp: i64) -> Order {
        let mut blocks = self.blocks.clone();
        blocks.push(block);
        Order {
            blocks,
            proposal_point: self.proposal_point,
            consensus_point: self.consensus_point,
            timestamp,
        }
    }

    /// A copy with the block sequence replaced. Fails if the new sequence is
    /// shorter than the current proposal point.
    pub fn with_blocks(&self, blocks: Vec<Ref>, timestamp: i64) -> DataResult<Order> {
        Order::new(blocks, self.proposal_point, self.consensus_point, timestamp)
    }

    /// A copy with both points replaced.
    pub fn with_points(
        &self,
        proposal_point: usize,
        consensus_point: usize,
        timestamp: i64,
    ) -> DataResult<Order> {
        Order::new(self.blocks.clone(), proposal_point, consensus_point, timestamp)
    }

    /// Number of leading blocks this order shares with `other`, by hash.
    pub fn common_prefix_len(&self, other: &Order) -> usize {
        self.blocks
            .iter()
            .zip(other.blocks.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Returns `true` if the first `n` blocks of both orders are identical.
    pub fn agrees_with(&self, other: &Order, n: usize) -> bool {
        self.len() >= n && other.len() >= n && self.blocks[..n] == other.blocks[..n]
    }

    /// Returns `true` if this order's blocks are the same as the first
    /// `self.len()` blocks of `other`.
    pub fn is_prefix_of(&self, other: &Order) -> bool {
        self.agrees_with(other, self.len())
    }
}

/// A peer's view of the network: the latest signed order of each known peer.
///
/// Entries map a peer's key to a ref of a `Cell::Signed` wrapping an
/// `Order`. Keys are ordered, so encoding does not depend on insertion order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Belief {
    orders: BTreeMap<AccountKey, Ref>,
}

impl Belief {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_orders(orders: BTreeMap<AccountKey, Ref>) -> Self {
        Self { orders }
    }

    pub fn orders(&self) -> &BTreeMap<AccountKey, Ref> {
        &self.orders
    }

    pub fn get(&self, key: &AccountKey) -> Option<&Ref> {
        self.orders.get(key)
    }

    /// A copy with the entry for `key` set to `signed_order`.
    pub fn with_order(&self, key: AccountKey, signed_order: Ref) -> Belief {
        let mut orders = self.orders.clone();
        orders.insert(key, signed_order);
        Belief { orders }
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(n: i64) -> Ref {
        Ref::new(Cell::Block(Block::new(n, Vec::new())))
    }

    fn chain(range: std::ops::Range<i64>) -> Vec<Ref> {
        range.map(block).collect()
    }

    #[test]
    fn order_points_validated() {
        assert!(Order::new(chain(0..3), 2, 1, 0).is_ok());
        assert!(matches!(
            Order::new(chain(0..3), 1, 2, 0),
            Err(DataError::InvalidData(_))
        ));
        assert!(matches!(
            Order::new(chain(0..3), 4, 0, 0),
            Err(DataError::InvalidData(_))
        ));
    }

    #[test]
    fn append_keeps_points() {
        let order = Order::new(chain(0..2), 2, 1, 10).unwrap();
        let next = order.append(block(9), 11);
        assert_eq!(next.len(), 3);
        assert_eq!(next.proposal_point(), 2);
        assert_eq!(next.consensus_point(), 1);
        assert_eq!(next.timestamp(), 11);
        assert_eq!(order.len(), 2);
    }

    #[test]
    fn with_blocks_cannot_drop_below_proposal() {
        let order = Order::new(chain(0..3), 3, 1, 0).unwrap();
        assert!(order.with_blocks(chain(0..2), 1).is_err());
        assert!(order.with_blocks(chain(0..5), 1).is_ok());
    }

    #[test]
    fn prefix_comparison() {
        let a = Order::new(chain(0..4), 0, 0, 0).unwrap();
        let b = Order::new(chain(0..2), 0, 0, 0).unwrap();
        let mut forked = chain(0..2);
        forked.push(block(100));
        let c = Order::new(forked, 0, 0, 0).unwrap();

        assert_eq!(a.common_prefix_len(&b), 2);
        assert_eq!(a.common_prefix_len(&c), 2);
        assert!(b.is_prefix_of(&a));
        assert!(!c.is_prefix_of(&a));
        assert!(a.agrees_with(&c, 2));
        assert!(!a.agrees_with(&c, 3));
        assert!(!b.agrees_with(&a, 3));
    }

    #[test]
    fn belief_entries_are_keyed() {
        let k1 = AccountKey::from_bytes([1; 32]);
        let k2 = AccountKey::from_bytes([2; 32]);
        let b = Belief::new()
            .with_order(k2, Ref::new(Cell::Long(2)))
            .with_order(k1, Ref::new(Cell::Long(1)));
        assert_eq!(b.len(), 2);
        let keys: Vec<_> = b.orders().keys().copied().collect();
        assert_eq!(keys, vec![k1, k2]);

        let replaced = b.with_order(k1, Ref::new(Cell::Long(3)));
        assert_eq!(replaced.get(&k1), Some(&Ref::new(Cell::Long(3))));
        assert_eq!(b.get(&k1), Some(&Ref::new(Cell::Long(1))));
    }
}
