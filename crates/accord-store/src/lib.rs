//! Content-addressed cell model for Accord.
//!
//! Every value exchanged between peers is a [`Cell`]: an immutable node with
//! a canonical encoding whose hash is its identity. Cells reference each
//! other through [`Ref`]s, which either hold the value directly or only its
//! hash, so partial graphs can be received, stored and resolved lazily.
//!
//! # Key Types
//!
//! - [`Cell`] -- closed sum of all value variants
//! - [`Ref`] / [`RefStatus`] -- lazy handle with monotonic persistence status
//! - [`Store`] -- pluggable content-addressed backend ([`MemoryStore`], [`FileStore`])
//! - [`SignedData`], [`Transaction`], [`Block`], [`Order`], [`Belief`] -- ledger records
//! - [`DataError`] -- missing data, invalid data, bad format, bad signature

pub mod cell;
pub mod error;
pub mod file;
pub mod format;
pub mod memory;
pub mod persist;
pub mod records;
pub mod reference;
pub mod refs;
pub mod signed;
pub mod traits;

pub use cell::Cell;
pub use error::{DataError, DataResult};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use persist::{announce, persist, persist_shallow, IgnoreNovelty, NoveltyVisitor};
pub use records::{Belief, Block, Order, Transaction};
pub use reference::{Ref, RefStatus};
pub use signed::SignedData;
pub use traits::Store;
