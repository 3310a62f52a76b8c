use std::collections::BTreeMap;

use accord_types::{AccountKey, Hash};
use serde::{Deserialize, Serialize};

/// The state consensus weighs against: peer stakes plus a digest of
/// everything executed so far.
///
/// Only the stake table is read by the merge. `block_count` and `state_hash`
/// are maintained by the [`BlockExecutor`](crate::executor::BlockExecutor).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusState {
    stakes: BTreeMap<AccountKey, u64>,
    total_stake: u64,
    /// Number of blocks applied since genesis.
    pub block_count: u64,
    /// Digest of the executed history.
    pub state_hash: Hash,
}

impl ConsensusState {
    /// Initial state with the given stake table. Zero stakes are dropped.
    pub fn genesis(stakes: impl IntoIterator<Item = (AccountKey, u64)>) -> Self {
        let stakes: BTreeMap<AccountKey, u64> =
            stakes.into_iter().filter(|(_, stake)| *stake > 0).collect();
        let total_stake = stakes.values().fold(0u64, |acc, s| acc.saturating_add(*s));
        Self {
            stakes,
            total_stake,
            block_count: 0,
            state_hash: Hash::ZERO,
        }
    }

    /// Stake held by `key`; zero if unknown.
    pub fn stake_of(&self, key: &AccountKey) -> u64 {
        self.stakes.get(key).copied().unwrap_or(0)
    }

    pub fn stakes(&self) -> &BTreeMap<AccountKey, u64> {
        &self.stakes
    }

    pub fn total_stake(&self) -> u64 {
        self.total_stake
    }

    /// A copy with a different stake table.
    pub fn with_stakes(&self, stakes: impl IntoIterator<Item = (AccountKey, u64)>) -> Self {
        let mut next = Self::genesis(stakes);
        next.block_count = self.block_count;
        next.state_hash = self.state_hash;
        next
    }
}

/// Fraction of total stake that must be strictly exceeded for agreement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Threshold {
    pub numerator: u64,
    pub denominator: u64,
}

impl Threshold {
    /// Two thirds of stake.
    pub const TWO_THIRDS: Self = Self {
        numerator: 2,
        denominator: 3,
    };

    /// Returns `true` if `stake` is strictly more than this fraction of
    /// `total`. Nothing exceeds the threshold of an empty stake table.
    pub fn is_exceeded(&self, stake: u64, total: u64) -> bool {
        if total == 0 {
            return false;
        }
        u128::from(stake) * u128::from(self.denominator)
            > u128::from(total) * u128::from(self.numerator)
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self::TWO_THIRDS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> AccountKey {
        AccountKey::from_bytes([n; 32])
    }

    #[test]
    fn genesis_totals_stake() {
        let state = ConsensusState::genesis([(key(1), 10), (key(2), 20), (key(3), 0)]);
        assert_eq!(state.total_stake(), 30);
        assert_eq!(state.stake_of(&key(2)), 20);
        assert_eq!(state.stake_of(&key(3)), 0);
        assert_eq!(state.stakes().len(), 2);
        assert_eq!(state.block_count, 0);
    }

    #[test]
    fn two_thirds_is_strict() {
        let t = Threshold::TWO_THIRDS;
        assert!(!t.is_exceeded(2, 3));
        assert!(t.is_exceeded(3, 4));
        assert!(!t.is_exceeded(66, 99));
        assert!(t.is_exceeded(67, 99));
        assert!(!t.is_exceeded(0, 0));
    }

    #[test]
    fn threshold_does_not_overflow() {
        assert!(Threshold::TWO_THIRDS.is_exceeded(u64::MAX, u64::MAX));
    }

    #[test]
    fn with_stakes_keeps_history() {
        let mut state = ConsensusState::genesis([(key(1), 1)]);
        state.block_count = 5;
        let next = state.with_stakes([(key(2), 7)]);
        assert_eq!(next.block_count, 5);
        assert_eq!(next.total_stake(), 7);
    }
}
