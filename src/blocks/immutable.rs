//! Content-addressed immutable blocks.
//!
//! The address commits to owner, payload and salt; validation is a hash
//! recomputation. There is no version and no seal step: the block is born
//! final. Removal needs the owner's signature unless the owner is null,
//! in which case anyone may remove.

use crate::address::Address;
use crate::crypto::PublicKey;
use crate::error::{Error, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Salt length for fresh content blocks.
pub const SALT_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImmutableBlock {
    pub owner: Option<PublicKey>,
    pub payload: Vec<u8>,
    pub salt: Vec<u8>,
}

impl ImmutableBlock {
    pub fn new(payload: Vec<u8>, owner: Option<PublicKey>) -> Self {
        let mut salt = vec![0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        Self { owner, payload, salt }
    }

    /// Deterministic constructor for pinned-address content.
    pub fn with_salt(payload: Vec<u8>, owner: Option<PublicKey>, salt: Vec<u8>) -> Self {
        Self { owner, payload, salt }
    }

    pub fn address(&self) -> Address {
        Address::for_content(self.owner.as_ref(), &self.payload, &self.salt)
    }

    /// Recompute the content hash; an address mismatch means the payload,
    /// salt or owner was tampered with.
    pub fn validate(&self, expected: &Address) -> Result<()> {
        let derived = self.address();
        if derived != *expected {
            return Err(Error::ValidationFailed(format!(
                "content hash mismatch: derived {derived}, stored under {expected}"
            )));
        }
        Ok(())
    }

    /// Wire shape before 0.2.0: no salt field.
    pub(crate) fn to_v1(&self) -> ImmutableBlockV1 {
        ImmutableBlockV1 { owner: self.owner.clone(), payload: self.payload.clone() }
    }
}

/// Serialized form of the 0.1.x wire format.
#[derive(Serialize, Deserialize)]
pub(crate) struct ImmutableBlockV1 {
    pub owner: Option<PublicKey>,
    pub payload: Vec<u8>,
}

impl From<ImmutableBlockV1> for ImmutableBlock {
    fn from(v1: ImmutableBlockV1) -> Self {
        // 0.1.x blocks were salted at allocation but the salt never made it
        // to the wire; their addresses derive from an empty salt.
        Self { owner: v1.owner, payload: v1.payload, salt: Vec::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn address_matches_content() {
        let kp = KeyPair::generate();
        let block = ImmutableBlock::with_salt(
            b"contents".to_vec(),
            Some(kp.public().clone()),
            b"salty".to_vec(),
        );
        let addr = block.address();
        assert!(block.validate(&addr).is_ok());

        let mut tampered = block.clone();
        tampered.payload = b"other".to_vec();
        assert!(tampered.validate(&addr).is_err());
    }

    #[test]
    fn fresh_blocks_get_distinct_salts() {
        let a = ImmutableBlock::new(b"same".to_vec(), None);
        let b = ImmutableBlock::new(b"same".to_vec(), None);
        assert_ne!(a.address(), b.address());
    }
}
