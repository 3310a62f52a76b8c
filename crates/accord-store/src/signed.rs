use std::sync::Arc;

use accord_crypto::{verify, KeyPair, Signature};
use accord_types::AccountKey;

use crate::cell::Cell;
use crate::error::{DataError, DataResult};
use crate::reference::Ref;
use crate::traits::Store;

/// A value together with a signer's key and an Ed25519 signature over the
/// value's hash.
///
/// Signing the hash rather than the full encoding means a signature can be
/// checked while the value itself is still hash-only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedData {
    key: AccountKey,
    signature: Signature,
    value: Ref,
}

impl SignedData {
    /// Sign `value` with `key_pair`.
    pub fn sign(key_pair: &KeyPair, value: Cell) -> Self {
        Self::sign_ref(key_pair, Ref::new(value))
    }

    /// Sign an existing ref. Only its hash is needed.
    pub fn sign_ref(key_pair: &KeyPair, value: Ref) -> Self {
        let signature = key_pair.sign(value.hash().as_bytes());
        Self {
            key: key_pair.account_key(),
            signature,
            value,
        }
    }

    /// Assemble from parts without checking. Use [`Self::check_signature`]
    /// before trusting the result.
    pub fn from_parts(key: AccountKey, signature: Signature, value: Ref) -> Self {
        Self {
            key,
            signature,
            value,
        }
    }

    /// The claimed signer.
    pub fn key(&self) -> &AccountKey {
        &self.key
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Ref to the signed value.
    pub fn value_ref(&self) -> &Ref {
        &self.value
    }

    /// The signed value, resolved through `store` if needed.
    pub fn value(&self, store: &dyn Store) -> DataResult<Arc<Cell>> {
        self.value.value(store)
    }

    /// Verify the signature against the claimed signer.
    pub fn check_signature(&self) -> DataResult<()> {
        verify(&self.key, self.value.hash().as_bytes(), &self.signature)
            .map_err(|_| DataError::BadSignature(self.key))
    }
}
