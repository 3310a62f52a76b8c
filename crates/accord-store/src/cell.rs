use accord_types::{Hash, CHUNK_LENGTH, MAX_BLOB_CHILDREN, MAX_EMBEDDED_LENGTH};

use crate::error::{DataError, DataResult};
use crate::format;
use crate::records::{Belief, Block, Order, Transaction};
use crate::reference::Ref;
use crate::signed::SignedData;
use crate::traits::Store;

/// An immutable value node.
///
/// Every variant has exactly one canonical encoding (see [`format`]), and a
/// cell's identity is the [`Hash`] of that encoding. Children are held as
/// [`Ref`]s, which may be direct or hash-only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cell {
    Nil,
    Bool(bool),
    Long(i64),
    /// A blob of at most [`CHUNK_LENGTH`] bytes.
    Blob(Vec<u8>),
    /// A blob longer than one chunk, split into chunk-sized [`Cell::Blob`]s.
    /// Every chunk is full except possibly the last.
    BlobTree { length: u64, chunks: Vec<Ref> },
    Vector(Vec<Ref>),
    Signed(SignedData),
    Transaction(Transaction),
    Block(Block),
    Order(Order),
    Belief(Belief),
}

impl Cell {
    /// Build a blob cell from raw bytes, chunking if necessary.
    pub fn blob(data: &[u8]) -> DataResult<Cell> {
        if data.len() <= CHUNK_LENGTH {
            return Ok(Cell::Blob(data.to_vec()));
        }
        let count = data.len().div_ceil(CHUNK_LENGTH);
        if count > MAX_BLOB_CHILDREN {
            return Err(DataError::InvalidData(format!(
                "blob of {} bytes exceeds {MAX_BLOB_CHILDREN} chunks",
                data.len()
            )));
        }
        let chunks = data
            .chunks(CHUNK_LENGTH)
            .map(|chunk| Ref::new(Cell::Blob(chunk.to_vec())))
            .collect();
        Ok(Cell::BlobTree {
            length: data.len() as u64,
            chunks,
        })
    }

    /// Vector of direct refs to the given cells.
    pub fn vector(items: impl IntoIterator<Item = Cell>) -> Cell {
        Cell::Vector(items.into_iter().map(Ref::new).collect())
    }

    /// Canonical encoding.
    pub fn encode(&self) -> Vec<u8> {
        format::encode(self)
    }

    /// Content hash of the canonical encoding.
    pub fn hash(&self) -> Hash {
        Hash::compute(&self.encode())
    }

    /// Returns `true` if this cell is inlined into parent encodings: its
    /// encoding is at most [`MAX_EMBEDDED_LENGTH`] and every child is itself
    /// embedded.
    pub fn is_embedded(&self) -> bool {
        self.is_embedded_with(&self.encode())
    }

    pub(crate) fn is_embedded_with(&self, encoding: &[u8]) -> bool {
        encoding.len() <= MAX_EMBEDDED_LENGTH && self.child_refs().iter().all(|r| r.is_embedded())
    }

    /// Direct child references, in encoding order.
    pub fn child_refs(&self) -> Vec<&Ref> {
        match self {
            Cell::Nil | Cell::Bool(_) | Cell::Long(_) | Cell::Blob(_) => Vec::new(),
            Cell::BlobTree { chunks, .. } => chunks.iter().collect(),
            Cell::Vector(items) => items.iter().collect(),
            Cell::Signed(signed) => vec![signed.value_ref()],
            Cell::Transaction(tx) => vec![&tx.payload],
            Cell::Block(block) => block.transactions.iter().collect(),
            Cell::Order(order) => order.blocks().iter().collect(),
            Cell::Belief(belief) => belief.orders().values().collect(),
        }
    }

    /// Number of direct child references.
    pub fn ref_count(&self) -> usize {
        self.child_refs().len()
    }

    /// Check structural invariants that can be verified without a store.
    pub fn validate(&self) -> DataResult<()> {
        match self {
            Cell::Blob(data) if data.len() > CHUNK_LENGTH => Err(DataError::InvalidData(
                format!("blob chunk of {} bytes", data.len()),
            )),
            Cell::BlobTree { length, chunks } => {
                let length = *length as usize;
                if length <= CHUNK_LENGTH {
                    return Err(DataError::InvalidData(format!(
                        "chunked blob of only {length} bytes"
                    )));
                }
                let expected = length.div_ceil(CHUNK_LENGTH);
                if chunks.len() != expected || expected > MAX_BLOB_CHILDREN {
                    return Err(DataError::InvalidData(format!(
                        "chunked blob of {length} bytes has {} chunks",
                        chunks.len()
                    )));
                }
                for (i, chunk) in chunks.iter().enumerate() {
                    let Some(value) = chunk.direct_value() else {
                        continue;
                    };
                    let want = chunk_length(length, i);
                    match value.as_ref() {
                        Cell::Blob(data) if data.len() == want => {}
                        _ => {
                            return Err(DataError::InvalidData(format!(
                                "chunk {i} is not a {want}-byte blob"
                            )))
                        }
                    }
                }
                Ok(())
            }
            Cell::Order(order) => order.validate(),
            _ => Ok(()),
        }
    }

    /// Total byte length if this is a blob.
    pub fn blob_length(&self) -> Option<u64> {
        match self {
            Cell::Blob(data) => Some(data.len() as u64),
            Cell::BlobTree { length, .. } => Some(*length),
            _ => None,
        }
    }

    /// Read one byte of a blob. Bytes in a chunk that is neither held
    /// directly nor in `store` raise [`DataError::MissingData`].
    pub fn blob_byte_at(&self, index: u64, store: &dyn Store) -> DataResult<u8> {
        let out_of_range = || DataError::InvalidData(format!("blob index {index} out of range"));
        match self {
            Cell::Blob(data) => data.get(index as usize).copied().ok_or_else(out_of_range),
            Cell::BlobTree { length, chunks } => {
                if index >= *length {
                    return Err(out_of_range());
                }
                let chunk = chunks
                    .get(index as usize / CHUNK_LENGTH)
                    .ok_or_else(out_of_range)?;
                let value = chunk.value(store)?;
                value.blob_byte_at(index % CHUNK_LENGTH as u64, store)
            }
            _ => Err(DataError::InvalidData("not a blob".into())),
        }
    }

    /// The full contents of a blob, resolving chunks through `store`.
    pub fn blob_bytes(&self, store: &dyn Store) -> DataResult<Vec<u8>> {
        match self {
            Cell::Blob(data) => Ok(data.clone()),
            Cell::BlobTree { length, chunks } => {
                let mut out = Vec::with_capacity(*length as usize);
                for chunk in chunks {
                    match chunk.value(store)?.as_ref() {
                        Cell::Blob(data) => out.extend_from_slice(data),
                        _ => return Err(DataError::InvalidData("blob chunk is not a blob".into())),
                    }
                }
                Ok(out)
            }
            _ => Err(DataError::InvalidData("not a blob".into())),
        }
    }

    pub fn as_signed(&self) -> Option<&SignedData> {
        match self {
            Cell::Signed(signed) => Some(signed),
            _ => None,
        }
    }

    pub fn as_transaction(&self) -> Option<&Transaction> {
        match self {
            Cell::Transaction(tx) => Some(tx),
            _ => None,
        }
    }

    pub fn as_block(&self) -> Option<&Block> {
        match self {
            Cell::Block(block) => Some(block),
            _ => None,
        }
    }

    pub fn as_order(&self) -> Option<&Order> {
        match self {
            Cell::Order(order) => Some(order),
            _ => None,
        }
    }

    pub fn as_belief(&self) -> Option<&Belief> {
        match self {
            Cell::Belief(belief) => Some(belief),
            _ => None,
        }
    }

    /// Short variant name for logs.
    pub fn type_name(&self) -> &'static str {
        match self {
            Cell::Nil => "nil",
            Cell::Bool(_) => "bool",
            Cell::Long(_) => "long",
            Cell::Blob(_) | Cell::BlobTree { .. } => "blob",
            Cell::Vector(_) => "vector",
            Cell::Signed(_) => "signed",
            Cell::Transaction(_) => "transaction",
            Cell::Block(_) => "block",
            Cell::Order(_) => "order",
            Cell::Belief(_) => "belief",
        }
    }
}

fn chunk_length(total: usize, index: usize) -> usize {
    (total - index * CHUNK_LENGTH).min(CHUNK_LENGTH)
}

impl From<bool> for Cell {
    fn from(value: bool) -> Self {
        Cell::Bool(value)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::Long(value)
    }
}

macro_rules! impl_from_record {
    ($($ty:ident),*) => {
        $(impl From<$ty> for Cell {
            fn from(value: $ty) -> Self {
                Cell::$ty(value)
            }
        })*
    };
}

impl_from_record!(Transaction, Block, Order, Belief);

impl From<SignedData> for Cell {
    fn from(value: SignedData) -> Self {
        Cell::Signed(value)
    }
}
