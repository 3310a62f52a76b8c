use std::collections::VecDeque;
use std::sync::Mutex;

use accord_consensus::{BlockProducer, PeerView};
use accord_store::{Block, Cell, Ref, Transaction};
use tracing::debug;

use crate::error::{PeerError, PeerResult};

/// Pending transactions waiting to be put in a block.
///
/// Transactions leave the queue in arrival order, at most
/// `max_per_block` at a time.
pub struct TransactionQueue {
    pending: Mutex<VecDeque<Ref>>,
    capacity: usize,
    max_per_block: usize,
}

impl TransactionQueue {
    pub fn new(capacity: usize, max_per_block: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            capacity,
            max_per_block: max_per_block.max(1),
        }
    }

    /// Queue a transaction. Fails without queuing when full.
    pub fn submit(&self, transaction: Transaction) -> PeerResult<Ref> {
        let tx = Ref::new(Cell::Transaction(transaction));
        let mut pending = self.pending.lock().expect("transaction queue lock poisoned");
        if pending.len() >= self.capacity {
            return Err(PeerError::TransactionQueueFull(self.capacity));
        }
        pending.push_back(tx.clone());
        Ok(tx)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().expect("transaction queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockProducer for TransactionQueue {
    fn maybe_generate_block(&self, view: &PeerView<'_>) -> Option<Block> {
        let mut pending = self.pending.lock().expect("transaction queue lock poisoned");
        if pending.is_empty() {
            return None;
        }
        let take = pending.len().min(self.max_per_block);
        let transactions: Vec<Ref> = pending.drain(..take).collect();
        debug!(
            peer = %view.key,
            transactions = transactions.len(),
            remaining = pending.len(),
            "generated block"
        );
        Some(Block::new(view.timestamp, transactions))
    }
}

impl std::fmt::Debug for TransactionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionQueue")
            .field("pending", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_consensus::ConsensusState;
    use accord_crypto::KeyPair;
    use accord_store::Order;

    fn tx(n: u64) -> Transaction {
        Transaction::new(KeyPair::from_seed([1; 32]).account_key(), n, Cell::Long(n as i64))
    }

    fn generate(queue: &TransactionQueue) -> Option<Block> {
        let kp = KeyPair::from_seed([1; 32]);
        let state = ConsensusState::genesis([(kp.account_key(), 1)]);
        let order = Order::empty(0);
        let view = PeerView {
            key: kp.account_key(),
            key_pair: &kp,
            timestamp: 77,
            state: &state,
            order: &order,
        };
        queue.maybe_generate_block(&view)
    }

    #[test]
    fn empty_queue_makes_no_block() {
        assert!(generate(&TransactionQueue::new(10, 10)).is_none());
    }

    #[test]
    fn blocks_take_in_order_up_to_limit() {
        let queue = TransactionQueue::new(10, 2);
        let refs: Vec<Ref> = (0..3).map(|n| queue.submit(tx(n)).unwrap()).collect();

        let first = generate(&queue).unwrap();
        assert_eq!(first.timestamp, 77);
        assert_eq!(first.transactions, refs[..2].to_vec());
        let second = generate(&queue).unwrap();
        assert_eq!(second.transactions, refs[2..].to_vec());
        assert!(queue.is_empty());
    }

    #[test]
    fn full_queue_rejects() {
        let queue = TransactionQueue::new(1, 1);
        queue.submit(tx(1)).unwrap();
        assert!(matches!(
            queue.submit(tx(2)),
            Err(PeerError::TransactionQueueFull(1))
        ));
        assert_eq!(queue.len(), 1);
    }
}
