use accord_types::Hash;

use crate::error::DataResult;
use crate::reference::{Ref, RefStatus};

/// Content-addressed cell store.
///
/// All implementations must satisfy these invariants:
/// - Entries are keyed by the hash of the cell's canonical encoding and are
///   never replaced by a different value.
/// - `put` is idempotent. Writing a hash that is already present returns the
///   existing entry, with its status raised if the new status is higher.
/// - Recorded status never decreases.
/// - Concurrent readers and writers are safe. Two writers racing on the same
///   hash both succeed and observe the same entry.
pub trait Store: Send + Sync {
    /// Look up an entry by hash.
    ///
    /// Returns `Ok(None)` if the hash is unknown, which is distinct from any
    /// stored value (including `Cell::Nil`).
    fn get(&self, hash: &Hash) -> DataResult<Option<Ref>>;

    /// Record a cell with at least the given status.
    ///
    /// Returns the stored ref (direct, with the recorded status) and whether
    /// the entry is new to this store. A hash-only ref can only raise the
    /// status of an existing entry; storing it fresh is a missing-data error.
    fn put(&self, r: &Ref, status: RefStatus) -> DataResult<(Ref, bool)>;

    /// Returns `true` if an entry exists for the hash.
    fn contains(&self, hash: &Hash) -> DataResult<bool> {
        Ok(self.get(hash)?.is_some())
    }

    /// Recorded status of a hash, or `Unknown` if absent.
    fn status_of(&self, hash: &Hash) -> DataResult<RefStatus> {
        Ok(self
            .get(hash)?
            .map(|r| r.status())
            .unwrap_or(RefStatus::Unknown))
    }
}
