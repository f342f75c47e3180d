//! Named blocks: well-known references published under `H(owner ∥ name)`.
//!
//! The address is independent of the payload, so a name can be resolved
//! before its content is known. The payload is immutable; publishing a
//! second block under the same name collides at insertion.

use crate::address::Address;
use crate::crypto::{KeyPair, PublicKey};
use crate::error::{Error, Result};
use crate::types::Signature;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedBlock {
    pub owner: Option<PublicKey>,
    pub name: Vec<u8>,
    pub payload: Vec<u8>,
    pub signature: Signature,
}

impl NamedBlock {
    /// Owner-bound named block, signed immediately.
    pub fn new(keys: &KeyPair, name: Vec<u8>, payload: Vec<u8>) -> Self {
        let owner = keys.public().clone();
        let address = Address::for_name(Some(&owner), &name);
        let signature = keys.sign(&Self::signed_bytes(&address, &name, &payload));
        Self { owner: Some(owner), name, payload, signature }
    }

    /// Anonymous named block; anyone can publish, removal policy is a
    /// configuration knob.
    pub fn anonymous(name: Vec<u8>, payload: Vec<u8>) -> Self {
        Self { owner: None, name, payload, signature: Vec::new() }
    }

    pub fn address(&self) -> Address {
        Address::for_name(self.owner.as_ref(), &self.name)
    }

    fn signed_bytes(address: &Address, name: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(32 + name.len() + payload.len());
        bytes.extend_from_slice(&address.0);
        bytes.extend_from_slice(name);
        bytes.extend_from_slice(payload);
        bytes
    }

    pub fn validate(&self, expected: &Address) -> Result<()> {
        let derived = self.address();
        if derived != *expected {
            return Err(Error::ValidationFailed(format!(
                "name-derived address mismatch: derived {derived}, stored under {expected}"
            )));
        }
        if let Some(owner) = &self.owner {
            let bytes = Self::signed_bytes(&derived, &self.name, &self.payload);
            owner
                .verify(&bytes, &self.signature)
                .map_err(|_| Error::ValidationFailed("named block signature check failed".into()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn address_ignores_payload() {
        let kp = KeyPair::generate();
        let a = NamedBlock::new(&kp, b"root".to_vec(), b"payload one".to_vec());
        let b = NamedBlock::new(&kp, b"root".to_vec(), b"payload two".to_vec());
        assert_eq!(a.address(), b.address());
        assert!(a.validate(&a.address()).is_ok());
    }

    #[test]
    fn payload_is_bound_by_signature() {
        let kp = KeyPair::generate();
        let block = NamedBlock::new(&kp, b"root".to_vec(), b"payload".to_vec());
        let addr = block.address();
        let mut forged = block.clone();
        forged.payload = b"swapped".to_vec();
        assert!(forged.validate(&addr).is_err());
    }

    #[test]
    fn anonymous_blocks_validate_without_signature() {
        let block = NamedBlock::anonymous(b"public-name".to_vec(), b"data".to_vec());
        assert!(block.validate(&block.address()).is_ok());
    }
}
