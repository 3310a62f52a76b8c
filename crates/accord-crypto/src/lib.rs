//! Cryptographic primitives for Accord.
//!
//! Peers sign their Orders and Blocks with Ed25519; anyone holding the
//! signer's [`AccountKey`](accord_types::AccountKey) can verify them. All
//! operations wrap `ed25519-dalek`; no custom cryptography.

pub mod keys;

pub use keys::{verify, KeyPair, Signature, SignatureError};
