//! Foundation types for Accord.
//!
//! This crate provides the identity and encoding primitives every other
//! Accord crate builds on.
//!
//! # Key Types
//!
//! - [`Hash`]: 32-byte BLAKE3 digest of a value's canonical encoding
//! - [`AccountKey`]: Ed25519 public key identifying a peer
//! - [`vlc`]: canonical variable-length unsigned integers
//! - [`limits`]: fixed system constants shared by encoder and transport

pub mod error;
pub mod hash;
pub mod identity;
pub mod limits;
pub mod vlc;

pub use error::TypeError;
pub use hash::Hash;
pub use identity::AccountKey;
pub use limits::{CHUNK_LENGTH, MAX_BLOB_CHILDREN, MAX_EMBEDDED_LENGTH, MAX_MESSAGE_LENGTH};
