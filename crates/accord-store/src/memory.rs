use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use accord_types::Hash;
use tracing::trace;

use crate::cell::Cell;
use crate::error::{DataError, DataResult};
use crate::reference::{Ref, RefStatus};
use crate::traits::Store;

struct Entry {
    cell: Arc<Cell>,
    status: RefStatus,
}

/// In-memory, HashMap-based cell store.
///
/// Holds every cell directly behind a `RwLock`. Values are shared via `Arc`,
/// so reads never copy cell data.
pub struct MemoryStore {
    entries: RwLock<HashMap<Hash, Entry>>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().expect("lock poisoned").is_empty()
    }

    /// Sorted list of all stored hashes.
    pub fn all_hashes(&self) -> Vec<Hash> {
        let map = self.entries.read().expect("lock poisoned");
        let mut hashes: Vec<Hash> = map.keys().copied().collect();
        hashes.sort();
        hashes
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn get(&self, hash: &Hash) -> DataResult<Option<Ref>> {
        let map = self.entries.read().expect("lock poisoned");
        Ok(map
            .get(hash)
            .map(|e| Ref::from_parts(*hash, Arc::clone(&e.cell), e.status)))
    }

    fn put(&self, r: &Ref, status: RefStatus) -> DataResult<(Ref, bool)> {
        let status = status.min(RefStatus::Persisted);
        let hash = *r.hash();
        let mut map = self.entries.write().expect("lock poisoned");
        if let Some(entry) = map.get_mut(&hash) {
            entry.status = entry.status.max(status);
            return Ok((returned_ref(r, Arc::clone(&entry.cell), entry.status), false));
        }
        let cell = r
            .direct_value()
            .cloned()
            .ok_or(DataError::MissingData(hash))?;
        map.insert(
            hash,
            Entry {
                cell: Arc::clone(&cell),
                status,
            },
        );
        trace!(hash = %hash.short_hex(), ?status, "stored cell");
        Ok((returned_ref(r, cell, status), true))
    }
}

/// The ref handed back from `put`: direct, and carrying the higher of the
/// caller's and the recorded status. Embedded refs stay embedded.
pub(crate) fn returned_ref(r: &Ref, cell: Arc<Cell>, recorded: RefStatus) -> Ref {
    let status = if r.is_embedded() {
        RefStatus::Embedded
    } else {
        recorded.max(r.status())
    };
    Ref::from_parts(*r.hash(), cell, status)
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entry_count", &self.len())
            .finish()
    }
}
