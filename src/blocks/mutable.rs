//! Owner-keyed mutable blocks.
//!
//! The address derives from the owner key plus an allocation salt and
//! stays stable across updates; the payload travels with a monotonically
//! increasing version under the owner's signature. Sealing always bumps
//! the version, so two seals of the same lineage never collide.

use crate::address::Address;
use crate::crypto::{KeyPair, PublicKey};
use crate::error::{Error, Result};
use crate::types::Signature;
use rand::RngCore;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutableBlock {
    pub owner: PublicKey,
    pub salt: Vec<u8>,
    pub version: u64,
    pub payload: Vec<u8>,
    pub signature: Signature,
}

impl MutableBlock {
    pub fn new(owner: PublicKey) -> Self {
        let mut salt = vec![0u8; super::immutable::SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        Self { owner, salt, version: 0, payload: Vec::new(), signature: Vec::new() }
    }

    pub fn address(&self) -> Address {
        Address::for_owner(&self.owner, &self.salt)
    }

    pub fn is_sealed(&self) -> bool {
        !self.signature.is_empty()
    }

    /// Replace the payload; the block must be re-sealed before storing.
    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
        self.signature.clear();
    }

    /// Bytes covered by the owner signature.
    pub(crate) fn signed_bytes(address: &Address, version: u64, payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(40 + payload.len());
        bytes.extend_from_slice(&address.0);
        bytes.extend_from_slice(&version.to_le_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Bump the version and sign `(address, version, payload)`.
    pub fn seal(&mut self, keys: &KeyPair) -> Result<()> {
        if keys.public() != &self.owner {
            return Err(Error::PermissionDenied);
        }
        self.version += 1;
        let bytes = Self::signed_bytes(&self.address(), self.version, &self.payload);
        self.signature = keys.sign(&bytes);
        Ok(())
    }

    pub fn validate(&self, expected: &Address) -> Result<()> {
        let derived = self.address();
        if derived != *expected {
            return Err(Error::ValidationFailed(format!(
                "owner-derived address mismatch: derived {derived}, stored under {expected}"
            )));
        }
        if !self.is_sealed() {
            return Err(Error::ValidationFailed("unsealed mutable block".into()));
        }
        let bytes = Self::signed_bytes(&derived, self.version, &self.payload);
        self.owner
            .verify(&bytes, &self.signature)
            .map_err(|_| Error::ValidationFailed("owner signature check failed".into()))
    }
}
