//! Canonical binary encoding of cells.
//!
//! Every encoding starts with a one-byte tag followed by a type-specific
//! payload:
//!
//! ```text
//! NIL          0x00
//! FALSE/TRUE   0xB0 / 0xB1
//! LONG         0x10  i64 big-endian
//! REF          0x20  32-byte hash            (child position only)
//! BLOB         0x31  vlc length, bytes       (length <= CHUNK_LENGTH)
//! BLOB_TREE    0x32  vlc length, chunks      (length > CHUNK_LENGTH)
//! VECTOR       0x80  vlc count, children
//! SIGNED       0x90  key[32], signature[64], child
//! TRANSACTION  0xD0  origin[32], vlc sequence, child
//! BLOCK        0xD1  i64 timestamp, vlc count, children
//! ORDER        0xD2  vlc consensus, vlc proposal, i64 timestamp, vlc count, children
//! BELIEF       0xD3  vlc count, (key[32], child)*   keys strictly ascending
//! ```
//!
//! A child is written inline if it is embedded and as `REF` plus its hash
//! otherwise. The decoder enforces the same rule, so any accepted encoding
//! re-encodes to identical bytes.

use std::collections::BTreeMap;
use std::sync::Arc;

use accord_crypto::Signature;
use accord_types::vlc::{read_vlc, write_vlc};
use accord_types::{AccountKey, Hash, CHUNK_LENGTH};

use crate::cell::Cell;
use crate::error::{DataError, DataResult};
use crate::records::{Belief, Block, Order, Transaction};
use crate::reference::{Ref, RefStatus};
use crate::signed::SignedData;

pub mod tags {
    pub const NIL: u8 = 0x00;
    pub const LONG: u8 = 0x10;
    pub const REF: u8 = 0x20;
    pub const BLOB: u8 = 0x31;
    pub const BLOB_TREE: u8 = 0x32;
    pub const VECTOR: u8 = 0x80;
    pub const SIGNED: u8 = 0x90;
    pub const FALSE: u8 = 0xB0;
    pub const TRUE: u8 = 0xB1;
    pub const TRANSACTION: u8 = 0xD0;
    pub const BLOCK: u8 = 0xD1;
    pub const ORDER: u8 = 0xD2;
    pub const BELIEF: u8 = 0xD3;
}

/// Canonical encoding of `cell`.
pub fn encode(cell: &Cell) -> Vec<u8> {
    let mut out = Vec::new();
    write_cell(&mut out, cell);
    out
}

/// Decode exactly one cell. Trailing bytes are a format error.
pub fn decode(bytes: &[u8]) -> DataResult<Cell> {
    let mut reader = Reader::new(bytes);
    let cell = reader.read_cell()?;
    if reader.remaining() > 0 {
        return Err(DataError::BadFormat(format!(
            "{} trailing bytes after {}",
            reader.remaining(),
            cell.type_name()
        )));
    }
    Ok(cell)
}

/// Decode the cell at the start of `bytes`, returning it with the number of
/// bytes it occupied. Used where cells are followed by other data.
pub fn decode_prefix(bytes: &[u8]) -> DataResult<(Cell, usize)> {
    let mut reader = Reader::new(bytes);
    let cell = reader.read_cell()?;
    Ok((cell, reader.pos))
}

/// Decode exactly one cell into a direct [`Ref`] whose hash is computed
/// from `bytes`.
pub fn decode_ref(bytes: &[u8]) -> DataResult<Ref> {
    let cell = decode(bytes)?;
    let status = if cell.is_embedded_with(bytes) {
        RefStatus::Embedded
    } else {
        RefStatus::Unknown
    };
    Ok(Ref::from_parts(Hash::compute(bytes), Arc::new(cell), status))
}

fn write_cell(out: &mut Vec<u8>, cell: &Cell) {
    match cell {
        Cell::Nil => out.push(tags::NIL),
        Cell::Bool(false) => out.push(tags::FALSE),
        Cell::Bool(true) => out.push(tags::TRUE),
        Cell::Long(value) => {
            out.push(tags::LONG);
            out.extend_from_slice(&value.to_be_bytes());
        }
        Cell::Blob(data) => {
            out.push(tags::BLOB);
            write_vlc(out, data.len() as u64);
            out.extend_from_slice(data);
        }
        Cell::BlobTree { length, chunks } => {
            out.push(tags::BLOB_TREE);
            write_vlc(out, *length);
            write_children(out, chunks);
        }
        Cell::Vector(items) => {
            out.push(tags::VECTOR);
            write_vlc(out, items.len() as u64);
            write_children(out, items);
        }
        Cell::Signed(signed) => {
            out.push(tags::SIGNED);
            out.extend_from_slice(signed.key().as_bytes());
            out.extend_from_slice(signed.signature().as_bytes());
            write_child(out, signed.value_ref());
        }
        Cell::Transaction(tx) => {
            out.push(tags::TRANSACTION);
            out.extend_from_slice(tx.origin.as_bytes());
            write_vlc(out, tx.sequence);
            write_child(out, &tx.payload);
        }
        Cell::Block(block) => {
            out.push(tags::BLOCK);
            out.extend_from_slice(&block.timestamp.to_be_bytes());
            write_vlc(out, block.transactions.len() as u64);
            write_children(out, &block.transactions);
        }
        Cell::Order(order) => {
            out.push(tags::ORDER);
            write_vlc(out, order.consensus_point() as u64);
            write_vlc(out, order.proposal_point() as u64);
            out.extend_from_slice(&order.timestamp().to_be_bytes());
            write_vlc(out, order.len() as u64);
            write_children(out, order.blocks());
        }
        Cell::Belief(belief) => {
            out.push(tags::BELIEF);
            write_vlc(out, belief.len() as u64);
            for (key, signed) in belief.orders() {
                out.extend_from_slice(key.as_bytes());
                write_child(out, signed);
            }
        }
    }
}

fn write_children(out: &mut Vec<u8>, children: &[Ref]) {
    for child in children {
        write_child(out, child);
    }
}

fn write_child(out: &mut Vec<u8>, child: &Ref) {
    match child.embedded_value() {
        Some(value) => write_cell(out, value),
        None => {
            out.push(tags::REF);
            out.extend_from_slice(child.hash().as_bytes());
        }
    }
}

/// Cursor over an encoding.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> DataResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(DataError::BadFormat(format!(
                "unexpected end of data at offset {} (need {n} bytes)",
                self.pos
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn byte(&mut self) -> DataResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn peek(&self) -> DataResult<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| DataError::BadFormat(format!("unexpected end of data at offset {}", self.pos)))
    }

    fn vlc(&mut self) -> DataResult<u64> {
        let (value, used) = read_vlc(self.data, self.pos)?;
        self.pos += used;
        Ok(value)
    }

    fn usize(&mut self) -> DataResult<usize> {
        let value = self.vlc()?;
        usize::try_from(value).map_err(|_| DataError::BadFormat(format!("length {value} too large")))
    }

    /// A count of children. Every child takes at least one byte, so a count
    /// larger than the remaining input is rejected before allocating.
    fn count(&mut self) -> DataResult<usize> {
        let count = self.usize()?;
        if count > self.remaining() {
            return Err(DataError::BadFormat(format!(
                "count {count} exceeds remaining {} bytes",
                self.remaining()
            )));
        }
        Ok(count)
    }

    fn i64(&mut self) -> DataResult<i64> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(arr))
    }

    fn array<const N: usize>(&mut self) -> DataResult<[u8; N]> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take(N)?);
        Ok(arr)
    }

    fn key(&mut self) -> DataResult<AccountKey> {
        Ok(AccountKey::from_bytes(self.array::<32>()?))
    }

    fn read_cell(&mut self) -> DataResult<Cell> {
        let tag = self.byte()?;
        let cell = match tag {
            tags::NIL => Cell::Nil,
            tags::FALSE => Cell::Bool(false),
            tags::TRUE => Cell::Bool(true),
            tags::LONG => Cell::Long(self.i64()?),
            tags::BLOB => {
                let length = self.usize()?;
                if length > CHUNK_LENGTH {
                    return Err(DataError::BadFormat(format!("flat blob of {length} bytes")));
                }
                Cell::Blob(self.take(length)?.to_vec())
            }
            tags::BLOB_TREE => {
                let length = self.vlc()?;
                let count = usize::try_from(length)
                    .map(|l| l.div_ceil(CHUNK_LENGTH))
                    .map_err(|_| DataError::BadFormat(format!("blob length {length} too large")))?;
                if length as usize <= CHUNK_LENGTH || count > self.remaining() {
                    return Err(DataError::BadFormat(format!("bad chunked blob length {length}")));
                }
                Cell::BlobTree {
                    length,
                    chunks: self.children(count)?,
                }
            }
            tags::VECTOR => {
                let count = self.count()?;
                Cell::Vector(self.children(count)?)
            }
            tags::SIGNED => {
                let key = self.key()?;
                let signature = Signature::from_bytes(self.array::<64>()?);
                let value = self.child()?;
                Cell::Signed(SignedData::from_parts(key, signature, value))
            }
            tags::TRANSACTION => {
                let origin = self.key()?;
                let sequence = self.vlc()?;
                let payload = self.child()?;
                Cell::Transaction(Transaction {
                    origin,
                    sequence,
                    payload,
                })
            }
            tags::BLOCK => {
                let timestamp = self.i64()?;
                let count = self.count()?;
                Cell::Block(Block::new(timestamp, self.children(count)?))
            }
            tags::ORDER => {
                let consensus_point = self.usize()?;
                let proposal_point = self.usize()?;
                let timestamp = self.i64()?;
                let count = self.count()?;
                let blocks = self.children(count)?;
                Cell::Order(Order::new(blocks, proposal_point, consensus_point, timestamp)?)
            }
            tags::BELIEF => {
                let count = self.count()?;
                let mut orders = BTreeMap::new();
                let mut last: Option<AccountKey> = None;
                for _ in 0..count {
                    let key = self.key()?;
                    if last.is_some_and(|prev| prev >= key) {
                        return Err(DataError::BadFormat(format!(
                            "belief keys out of order at {key}"
                        )));
                    }
                    last = Some(key);
                    orders.insert(key, self.child()?);
                }
                Cell::Belief(Belief::from_orders(orders))
            }
            tags::REF => {
                return Err(DataError::BadFormat("ref tag outside child position".into()))
            }
            other => return Err(DataError::BadFormat(format!("unknown tag 0x{other:02x}"))),
        };
        cell.validate()?;
        Ok(cell)
    }

    fn children(&mut self, count: usize) -> DataResult<Vec<Ref>> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.child()?);
        }
        Ok(out)
    }

    fn child(&mut self) -> DataResult<Ref> {
        if self.peek()? == tags::REF {
            self.pos += 1;
            let hash = Hash::from_bytes(self.array::<32>()?);
            return Ok(Ref::for_hash(hash));
        }
        let start = self.pos;
        let cell = self.read_cell()?;
        let bytes = &self.data[start..self.pos];
        if !cell.is_embedded_with(bytes) {
            return Err(DataError::BadFormat(format!(
                "non-embeddable {} of {} bytes written inline",
                cell.type_name(),
                bytes.len()
            )));
        }
        Ok(Ref::from_parts(
            Hash::compute(bytes),
            Arc::new(cell),
            RefStatus::Embedded,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_crypto::KeyPair;
    use accord_types::MAX_EMBEDDED_LENGTH;
    use proptest::prelude::*;

    #[test]
    fn decode_prefix_stops_after_one_cell() {
        let mut bytes = encode(&Cell::Long(7));
        let first = bytes.len();
        bytes.extend_from_slice(&encode(&Cell::Bool(true)));
        let (cell, used) = decode_prefix(&bytes).unwrap();
        assert_eq!(cell, Cell::Long(7));
        assert_eq!(used, first);
        assert!(decode(&bytes).is_err());
    }

    fn roundtrip(cell: &Cell) {
        let bytes = encode(cell);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(&decoded, cell);
        assert_eq!(encode(&decoded), bytes);
    }

    fn sample_order(kp: &KeyPair) -> Cell {
        let tx = Transaction::new(kp.account_key(), 1, Cell::blob(b"transfer 10").unwrap());
        let signed_tx = Ref::new(Cell::Signed(SignedData::sign(kp, Cell::Transaction(tx))));
        let block = Ref::new(Cell::Block(Block::new(1000, vec![signed_tx])));
        Cell::Order(Order::new(vec![block.clone(), block], 1, 1, 1001).unwrap())
    }

    // -----------------------------------------------------------------------
    // Round trips
    // -----------------------------------------------------------------------

    #[test]
    fn scalars() {
        roundtrip(&Cell::Nil);
        roundtrip(&Cell::Bool(true));
        roundtrip(&Cell::Bool(false));
        roundtrip(&Cell::Long(i64::MIN));
        roundtrip(&Cell::Long(0));
        assert_eq!(encode(&Cell::Nil), vec![tags::NIL]);
        assert_eq!(encode(&Cell::Long(1)), vec![0x10, 0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn blobs() {
        roundtrip(&Cell::blob(b"").unwrap());
        roundtrip(&Cell::blob(&[5u8; CHUNK_LENGTH]).unwrap());
        roundtrip(&Cell::blob(&vec![6u8; 3 * CHUNK_LENGTH + 1]).unwrap());
    }

    #[test]
    fn records() {
        let kp = KeyPair::from_seed([4; 32]);
        let order = sample_order(&kp);
        roundtrip(&order);

        let signed = Ref::new(Cell::Signed(SignedData::sign(&kp, order)));
        let belief = Cell::Belief(Belief::new().with_order(kp.account_key(), signed));
        roundtrip(&belief);
    }

    #[test]
    fn nested_vectors() {
        let inner = Cell::vector((0..20).map(Cell::Long));
        let outer = Cell::vector([inner.clone(), inner, Cell::Nil]);
        roundtrip(&outer);
    }

    // -----------------------------------------------------------------------
    // Child placement
    // -----------------------------------------------------------------------

    #[test]
    fn external_children_written_as_refs() {
        let big = Cell::blob(&[1u8; 500]).unwrap();
        let hash = big.hash();
        let v = Cell::vector([big]);
        let bytes = encode(&v);
        assert_eq!(bytes.len(), 1 + 1 + 1 + 32);
        assert_eq!(bytes[2], tags::REF);
        assert_eq!(&bytes[3..], hash.as_bytes());

        let decoded = decode(&bytes).unwrap();
        let child = decoded.child_refs()[0];
        assert!(!child.is_direct());
        assert_eq!(child.hash(), &hash);
    }

    #[test]
    fn inline_children_are_direct_and_embedded() {
        let v = Cell::vector([Cell::Long(3)]);
        let decoded = decode(&encode(&v)).unwrap();
        let child = decoded.child_refs()[0];
        assert!(child.is_embedded());
        assert_eq!(child.hash(), &Cell::Long(3).hash());
    }

    #[test]
    fn decode_ref_marks_embedding() {
        let small = decode_ref(&encode(&Cell::Long(8))).unwrap();
        assert!(small.is_embedded());
        let big = Cell::blob(&[0u8; MAX_EMBEDDED_LENGTH]).unwrap();
        let r = decode_ref(&encode(&big)).unwrap();
        assert!(!r.is_embedded());
        assert_eq!(r.hash(), &big.hash());
    }

    // -----------------------------------------------------------------------
    // Rejections
    // -----------------------------------------------------------------------

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = encode(&Cell::Long(1));
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(DataError::BadFormat(_))));
    }

    #[test]
    fn rejects_truncation_and_unknown_tags() {
        let bytes = encode(&Cell::Long(1));
        assert!(matches!(decode(&bytes[..4]), Err(DataError::BadFormat(_))));
        assert!(matches!(decode(&[0x7f]), Err(DataError::BadFormat(_))));
        assert!(matches!(decode(&[]), Err(DataError::BadFormat(_))));
        assert!(matches!(decode(&[tags::REF; 33]), Err(DataError::BadFormat(_))));
    }

    #[test]
    fn rejects_oversized_inline_child() {
        // A vector with a 200-byte blob written inline instead of by hash.
        let mut bytes = vec![tags::VECTOR, 1];
        bytes.extend(encode(&Cell::blob(&[2u8; 200]).unwrap()));
        assert!(matches!(decode(&bytes), Err(DataError::BadFormat(_))));
    }

    #[test]
    fn rejects_huge_counts() {
        let mut bytes = vec![tags::VECTOR];
        write_vlc(&mut bytes, 1_000_000);
        assert!(matches!(decode(&bytes), Err(DataError::BadFormat(_))));
    }

    #[test]
    fn rejects_unsorted_belief_keys() {
        let mut bytes = vec![tags::BELIEF, 2];
        bytes.extend_from_slice(&[9u8; 32]);
        bytes.push(tags::NIL);
        bytes.extend_from_slice(&[1u8; 32]);
        bytes.push(tags::NIL);
        assert!(matches!(decode(&bytes), Err(DataError::BadFormat(_))));
    }

    #[test]
    fn invalid_order_points_are_invalid_data() {
        let mut bytes = vec![tags::ORDER];
        write_vlc(&mut bytes, 2); // consensus
        write_vlc(&mut bytes, 1); // proposal
        bytes.extend_from_slice(&0i64.to_be_bytes());
        write_vlc(&mut bytes, 0);
        assert!(matches!(decode(&bytes), Err(DataError::InvalidData(_))));
    }

    fn arb_cell() -> impl Strategy<Value = Cell> {
        let leaf = prop_oneof![
            Just(Cell::Nil),
            any::<bool>().prop_map(Cell::Bool),
            any::<i64>().prop_map(Cell::Long),
            proptest::collection::vec(any::<u8>(), 0..600)
                .prop_map(|b| Cell::blob(&b).expect("within one chunk")),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            proptest::collection::vec(inner, 0..6).prop_map(Cell::vector)
        })
    }

    proptest! {
        #[test]
        fn encoding_is_canonical(cell in arb_cell()) {
            let bytes = encode(&cell);
            let decoded = decode(&bytes).unwrap();
            prop_assert_eq!(&decoded, &cell);
            prop_assert_eq!(encode(&decoded), bytes);
        }
    }
}
