use std::cmp::Ordering;
use std::sync::Arc;

use accord_types::Hash;
use serde::{Deserialize, Serialize};

use crate::cell::Cell;
use crate::error::{DataError, DataResult};
use crate::traits::Store;

/// How far a [`Ref`] is known to have been written to a store.
///
/// Status only ever increases. `Embedded` is terminal: the cell is small and
/// self-contained, lives inline in its parent, and never needs its own entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RefStatus {
    /// Nothing known about storage.
    Unknown,
    /// The cell itself is in the store; its children may not be.
    Stored,
    /// The cell and every non-embedded descendant are in the store.
    Persisted,
    /// Inlined in its parent's encoding.
    Embedded,
}

/// Handle to a [`Cell`], either holding the value directly or only its hash.
///
/// Two refs with the same hash are interchangeable: equality, ordering and
/// hashing all go through the [`Hash`], never object identity.
#[derive(Clone)]
pub struct Ref {
    hash: Hash,
    value: Option<Arc<Cell>>,
    status: RefStatus,
}

impl Ref {
    /// Create a direct ref to a cell, computing its hash from its encoding.
    pub fn new(cell: Cell) -> Self {
        let encoding = cell.encode();
        let embedded = cell.is_embedded_with(&encoding);
        Self {
            hash: Hash::compute(&encoding),
            value: Some(Arc::new(cell)),
            status: if embedded {
                RefStatus::Embedded
            } else {
                RefStatus::Unknown
            },
        }
    }

    /// Create a hash-only ref. Resolving it requires a store.
    pub fn for_hash(hash: Hash) -> Self {
        Self {
            hash,
            value: None,
            status: RefStatus::Unknown,
        }
    }

    /// Direct ref with an already-known hash and status. Callers guarantee
    /// that `hash` is the hash of `value`'s encoding.
    pub(crate) fn from_parts(hash: Hash, value: Arc<Cell>, status: RefStatus) -> Self {
        Self {
            hash,
            value: Some(value),
            status,
        }
    }

    /// The content hash of the referenced cell.
    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    /// Current persistence status.
    pub fn status(&self) -> RefStatus {
        self.status
    }

    /// Returns `true` if the value is held directly.
    pub fn is_direct(&self) -> bool {
        self.value.is_some()
    }

    /// Returns `true` if the cell is inlined into parent encodings.
    pub fn is_embedded(&self) -> bool {
        self.status == RefStatus::Embedded
    }

    /// Returns `true` if the cell needs nothing further written to be
    /// resolvable from the store, including all of its descendants.
    pub fn is_persisted(&self) -> bool {
        self.status >= RefStatus::Persisted
    }

    /// The directly held value, if any. Never touches a store.
    pub fn direct_value(&self) -> Option<&Arc<Cell>> {
        self.value.as_ref()
    }

    /// The value, materialised from `store` if only the hash is held.
    pub fn value(&self, store: &dyn Store) -> DataResult<Arc<Cell>> {
        if let Some(value) = &self.value {
            return Ok(Arc::clone(value));
        }
        self.load(store)?
            .and_then(|r| r.value)
            .ok_or(DataError::MissingData(self.hash))
    }

    /// Re-derive this ref against a store: the result holds the value
    /// directly and its status is at least the store's recorded status.
    pub fn resolve(&self, store: &dyn Store) -> DataResult<Ref> {
        if self.is_embedded() {
            return Ok(self.clone());
        }
        let stored = if self.is_direct() {
            store.get(&self.hash)?
        } else {
            self.load(store)?
        };
        match stored {
            Some(stored) => Ok(stored.with_min_status(self.status)),
            None if self.is_direct() => Ok(self.clone()),
            None => Err(DataError::MissingData(self.hash)),
        }
    }

    /// Look up a hash-only ref. A cell small enough to be inlined is never
    /// referenced by hash in a canonical encoding, so finding one is invalid.
    fn load(&self, store: &dyn Store) -> DataResult<Option<Ref>> {
        let stored = store.get(&self.hash)?;
        if let Some(cell) = stored.as_ref().and_then(|r| r.direct_value()) {
            if cell.is_embedded() {
                return Err(DataError::InvalidData(format!(
                    "embeddable {} referenced by hash {}",
                    cell.type_name(),
                    self.hash.short_hex()
                )));
            }
        }
        Ok(stored)
    }

    /// A copy of this ref with status raised to at least `status`.
    ///
    /// Status never decreases, and a non-embedded ref never becomes
    /// `Embedded`: the highest it reaches is `Persisted`.
    pub fn with_min_status(&self, status: RefStatus) -> Ref {
        let status = if self.is_embedded() {
            RefStatus::Embedded
        } else {
            self.status.max(status.min(RefStatus::Persisted))
        };
        Ref {
            hash: self.hash,
            value: self.value.clone(),
            status,
        }
    }

    /// A direct copy of this ref, loading the value from `store` if needed.
    pub fn to_direct(&self, store: &dyn Store) -> DataResult<Ref> {
        if self.is_direct() {
            return Ok(self.clone());
        }
        let value = self.value(store)?;
        Ok(Ref {
            hash: self.hash,
            value: Some(value),
            status: self.status,
        })
    }

    /// The inline value when this ref is embedded.
    pub(crate) fn embedded_value(&self) -> Option<&Arc<Cell>> {
        if self.is_embedded() {
            self.value.as_ref()
        } else {
            None
        }
    }
}

impl From<Cell> for Ref {
    fn from(cell: Cell) -> Self {
        Ref::new(cell)
    }
}

impl PartialEq for Ref {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Ref {}

impl PartialOrd for Ref {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ref {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hash.cmp(&other.hash)
    }
}

impl std::hash::Hash for Ref {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl std::fmt::Debug for Ref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Ref({}, {:?}{})",
            self.hash.short_hex(),
            self.status,
            if self.is_direct() { "" } else { ", hash-only" }
        )
    }
}
