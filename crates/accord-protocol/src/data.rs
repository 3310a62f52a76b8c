//! Multi-cell message data.
//!
//! A message carries one root cell followed by any number of further cells
//! the receiver may need to resolve it:
//!
//! ```text
//! [root encoding] ([vlc length][cell encoding])*
//! ```
//!
//! The root is self-delimiting. Each further cell is length-prefixed so a
//! receiver can skip or store it without interpreting it.

use std::collections::HashSet;

use accord_store::{format, Cell, DataError, DataResult, Ref};
use accord_types::vlc::{read_vlc, vlc_length, write_vlc};
use accord_types::Hash;

static NIL: Cell = Cell::Nil;

/// A decoded message body.
#[derive(Clone, Debug)]
pub struct Payload {
    root: Ref,
    cells: Vec<Ref>,
}

impl Payload {
    pub fn new(root: Ref, cells: Vec<Ref>) -> Self {
        Self { root, cells }
    }

    /// The root cell as a direct ref.
    pub fn root(&self) -> &Ref {
        &self.root
    }

    /// The root cell value. Roots are always held directly.
    pub fn value(&self) -> &Cell {
        self.root.direct_value().map_or(&NIL, |cell| cell.as_ref())
    }

    /// Cells accompanying the root, in message order.
    pub fn cells(&self) -> &[Ref] {
        &self.cells
    }
}

/// Encode `root` followed by each of `cells`.
///
/// Cells equal to the root or to an earlier cell are written once. Embedded
/// cells are skipped, since they travel inside their parents.
pub fn encode_multi(root: &Cell, cells: &[Ref]) -> Vec<u8> {
    let mut out = root.encode();
    let mut written: HashSet<Hash> = HashSet::new();
    written.insert(root.hash());
    for cell in cells {
        if cell.is_embedded() || !written.insert(*cell.hash()) {
            continue;
        }
        let Some(value) = cell.direct_value() else {
            continue;
        };
        let encoding = value.encode();
        out.reserve(vlc_length(encoding.len() as u64) + encoding.len());
        write_vlc(&mut out, encoding.len() as u64);
        out.extend_from_slice(&encoding);
    }
    out
}

/// Decode message data into its root and accompanying cells.
pub fn decode_multi(data: &[u8]) -> DataResult<Payload> {
    let (root, mut pos) = format::decode_prefix(data)?;
    let mut cells = Vec::new();
    while pos < data.len() {
        let (length, used) = read_vlc(data, pos)?;
        pos += used;
        let length = usize::try_from(length)
            .ok()
            .filter(|l| *l <= data.len() - pos)
            .ok_or_else(|| {
                DataError::BadFormat(format!("cell length {length} overruns message at {pos}"))
            })?;
        cells.push(format::decode_ref(&data[pos..pos + length])?);
        pos += length;
    }
    Ok(Payload::new(Ref::new(root), cells))
}
