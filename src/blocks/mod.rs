//! The typed block model: one tagged sum over four variants with a shared
//! operation set (address, validate, seal, sign-remove, serialize).
//!
//! Serialization is a versioned envelope (`[major][minor][patch][tag]` +
//! postcard body) used both on the wire and in the silo, plus a
//! self-describing JSON export for debugging and administration.

pub mod acl;
pub mod immutable;
mod json;
pub mod mutable;
pub mod named;

pub use acl::{AclBlock, AclEntry};
pub use immutable::ImmutableBlock;
pub use mutable::MutableBlock;
pub use named::NamedBlock;

use crate::address::Address;
use crate::crypto::{KeyPair, PublicKey};
use crate::error::{Error, Result};
use crate::types::{Signature, Version};
use crate::wire::{self, WireError};
use serde::{Deserialize, Serialize};

/// Envelope tags for block variants. Tag 5 is reserved for the consensus
/// layer's paxos records, which share the envelope.
pub const TAG_IMMUTABLE: u8 = 1;
pub const TAG_MUTABLE: u8 = 2;
pub const TAG_ACL: u8 = 3;
pub const TAG_NAMED: u8 = 4;
pub const TAG_PAXOS: u8 = 5;

/// How a store call treats an existing block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreMode {
    /// Fail with a collision if the address exists.
    Insert,
    /// Fail with a missing block if it does not.
    Update,
}

/// A signed authorization to delete one block. Anonymous removals (null
/// signer, no signature) are valid only where the variant allows them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveSignature {
    pub address: Address,
    /// Signing key; None means the block owner signed.
    pub signer: Option<PublicKey>,
    pub signature: Option<Signature>,
}

impl RemoveSignature {
    pub fn anonymous(address: Address) -> Self {
        Self { address, signer: None, signature: None }
    }

    fn signed_bytes(address: &Address) -> Vec<u8> {
        let mut bytes = b"remove".to_vec();
        bytes.extend_from_slice(&address.0);
        bytes
    }

    fn verify_by(&self, key: &PublicKey) -> Result<()> {
        let signature = self
            .signature
            .as_ref()
            .ok_or_else(|| Error::ValidationFailed("unsigned removal".into()))?;
        key.verify(&Self::signed_bytes(&self.address), signature)
            .map_err(|_| Error::ValidationFailed("removal signature check failed".into()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Block {
    Immutable(ImmutableBlock),
    Mutable(MutableBlock),
    Acl(AclBlock),
    Named(NamedBlock),
}

impl Block {
    pub fn address(&self) -> Address {
        match self {
            Block::Immutable(b) => b.address(),
            Block::Mutable(b) => b.address(),
            Block::Acl(b) => b.address(),
            Block::Named(b) => b.address(),
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            Block::Immutable(_) => TAG_IMMUTABLE,
            Block::Mutable(_) => TAG_MUTABLE,
            Block::Acl(_) => TAG_ACL,
            Block::Named(_) => TAG_NAMED,
        }
    }

    /// The stored payload (ciphertext for encrypted ACL blocks).
    pub fn data(&self) -> &[u8] {
        match self {
            Block::Immutable(b) => &b.payload,
            Block::Mutable(b) => &b.payload,
            Block::Acl(b) => &b.payload,
            Block::Named(b) => &b.payload,
        }
    }

    /// Mutation version; immutable variants are always 0.
    pub fn version(&self) -> u64 {
        match self {
            Block::Mutable(b) => b.version,
            Block::Acl(b) => b.version,
            Block::Immutable(_) | Block::Named(_) => 0,
        }
    }

    pub fn is_mutable(&self) -> bool {
        matches!(self, Block::Mutable(_) | Block::Acl(_))
    }

    /// Replace the payload of a mutable variant; the block needs a fresh
    /// seal afterwards.
    pub fn set_data(&mut self, data: Vec<u8>) -> Result<()> {
        match self {
            Block::Mutable(b) => {
                b.set_payload(data);
                Ok(())
            }
            Block::Acl(b) => {
                b.set_payload(data);
                Ok(())
            }
            Block::Immutable(_) | Block::Named(_) => Err(Error::ValidationFailed(
                "immutable payloads cannot change".into(),
            )),
        }
    }

    /// Rebase a mutable variant onto a version (the next seal signs
    /// `version + 1`). Resolvers use this to land a merge on top of the
    /// currently chosen version.
    pub fn rebase(&mut self, version: u64) -> Result<()> {
        match self {
            Block::Mutable(b) => {
                b.version = version;
                b.signature.clear();
                Ok(())
            }
            Block::Acl(b) => {
                b.version = version;
                b.signature.clear();
                Ok(())
            }
            Block::Immutable(_) | Block::Named(_) => Err(Error::ValidationFailed(
                "immutable blocks have no version".into(),
            )),
        }
    }

    pub fn is_sealed(&self) -> bool {
        match self {
            Block::Mutable(b) => b.is_sealed(),
            Block::Acl(b) => b.is_sealed(),
            // Born sealed: the address (and optional signature) is fixed
            // at construction.
            Block::Immutable(_) | Block::Named(_) => true,
        }
    }

    /// Seal mutable variants with the given keys; no-op for the rest.
    pub fn seal(&mut self, keys: &KeyPair) -> Result<()> {
        match self {
            Block::Mutable(b) => b.seal(keys),
            Block::Acl(b) => b.seal(keys),
            Block::Immutable(_) | Block::Named(_) => Ok(()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.validate_at(&self.address())
    }

    /// Validate against the address the block is stored under.
    pub fn validate_at(&self, address: &Address) -> Result<()> {
        match self {
            Block::Immutable(b) => b.validate(address),
            Block::Mutable(b) => b.validate(address),
            Block::Acl(b) => b.validate(address),
            Block::Named(b) => b.validate(address),
        }
    }

    /// Plaintext payload, decrypting ACL data with the caller's keys.
    pub fn decrypt(&self, keys: &KeyPair) -> Result<Vec<u8>> {
        match self {
            Block::Acl(b) => b.decrypt(keys),
            other => Ok(other.data().to_vec()),
        }
    }

    /// Produce the removal authorization this block requires.
    pub fn sign_remove(&self, keys: &KeyPair) -> Result<RemoveSignature> {
        let address = self.address();
        let bytes = RemoveSignature::signed_bytes(&address);
        match self {
            Block::Immutable(b) => match &b.owner {
                None => Ok(RemoveSignature::anonymous(address)),
                Some(owner) if owner == keys.public() => Ok(RemoveSignature {
                    address,
                    signer: None,
                    signature: Some(keys.sign(&bytes)),
                }),
                Some(_) => Err(Error::PermissionDenied),
            },
            Block::Mutable(b) => {
                if &b.owner != keys.public() {
                    return Err(Error::PermissionDenied);
                }
                Ok(RemoveSignature { address, signer: None, signature: Some(keys.sign(&bytes)) })
            }
            Block::Acl(b) => {
                let signer = if keys.public() == &b.owner {
                    None
                } else if b.can_write(keys.public()) {
                    Some(keys.public().clone())
                } else {
                    return Err(Error::PermissionDenied);
                };
                Ok(RemoveSignature { address, signer, signature: Some(keys.sign(&bytes)) })
            }
            Block::Named(b) => match &b.owner {
                None => Ok(RemoveSignature::anonymous(address)),
                Some(owner) if owner == keys.public() => Ok(RemoveSignature {
                    address,
                    signer: None,
                    signature: Some(keys.sign(&bytes)),
                }),
                Some(_) => Err(Error::PermissionDenied),
            },
        }
    }

    /// Check a removal authorization against this block.
    pub fn check_remove(
        &self,
        rs: &RemoveSignature,
        allow_anonymous_named_removal: bool,
    ) -> Result<()> {
        if rs.address != self.address() {
            return Err(Error::ValidationFailed("removal for a different address".into()));
        }
        match self {
            Block::Immutable(b) => match &b.owner {
                None => Ok(()),
                Some(owner) => rs.verify_by(owner),
            },
            Block::Mutable(b) => rs.verify_by(&b.owner),
            Block::Acl(b) => match &rs.signer {
                None => rs.verify_by(&b.owner),
                Some(key) => {
                    if !b.can_write(key) {
                        return Err(Error::PermissionDenied);
                    }
                    rs.verify_by(key)
                }
            },
            Block::Named(b) => match &b.owner {
                Some(owner) => rs.verify_by(owner),
                None if allow_anonymous_named_removal => Ok(()),
                None => Err(Error::PermissionDenied),
            },
        }
    }

    // =========================================================================
    // SERIALIZATION
    // =========================================================================

    /// Serialize into the versioned binary envelope.
    pub fn to_wire(&self, version: Version) -> std::result::Result<Vec<u8>, WireError> {
        if version < Version::new(0, 2, 0) {
            // 0.1.x: immutable blocks had no salt, ACL entries no
            // admin/owner bits; the other variants are unchanged.
            return match self {
                Block::Immutable(b) => wire::seal_envelope(version, TAG_IMMUTABLE, &b.to_v1()),
                Block::Acl(b) => wire::seal_envelope(version, TAG_ACL, &b.to_v1()),
                Block::Mutable(b) => wire::seal_envelope(version, TAG_MUTABLE, b),
                Block::Named(b) => wire::seal_envelope(version, TAG_NAMED, b),
            };
        }
        match self {
            Block::Immutable(b) => wire::seal_envelope(version, TAG_IMMUTABLE, b),
            Block::Mutable(b) => wire::seal_envelope(version, TAG_MUTABLE, b),
            Block::Acl(b) => wire::seal_envelope(version, TAG_ACL, b),
            Block::Named(b) => wire::seal_envelope(version, TAG_NAMED, b),
        }
    }

    /// Deserialize any supported envelope version.
    pub fn from_wire(data: &[u8]) -> std::result::Result<Block, WireError> {
        let (version, tag, body) = wire::open_envelope(data)?;
        let old = version < Version::new(0, 2, 0);
        match tag {
            TAG_IMMUTABLE if old => {
                let v1: immutable::ImmutableBlockV1 = wire::from_bytes(body)?;
                Ok(Block::Immutable(v1.into()))
            }
            TAG_ACL if old => {
                let v1: acl::AclBlockV1 = wire::from_bytes(body)?;
                Ok(Block::Acl(v1.into()))
            }
            TAG_IMMUTABLE => Ok(Block::Immutable(wire::from_bytes(body)?)),
            TAG_MUTABLE => Ok(Block::Mutable(wire::from_bytes(body)?)),
            TAG_ACL => Ok(Block::Acl(wire::from_bytes(body)?)),
            TAG_NAMED => Ok(Block::Named(wire::from_bytes(body)?)),
            other => Err(WireError::UnknownTag(other)),
        }
    }

    /// Self-describing JSON export.
    pub fn to_json(&self) -> serde_json::Value {
        json::to_json(self)
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Block> {
        json::from_json(value)
    }
}

impl std::fmt::Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Block::Immutable(_) => "immutable",
            Block::Mutable(_) => "mutable",
            Block::Acl(_) => "acl",
            Block::Named(_) => "named",
        };
        write!(f, "{kind}({:?}, v{})", self.address(), self.version())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn wire_roundtrip_every_variant() {
        let kp = KeyPair::generate();
        let reader = KeyPair::generate();

        let mut mutable = MutableBlock::new(kp.public().clone());
        mutable.set_payload(b"mutable".to_vec());
        mutable.seal(&kp).unwrap();

        let mut acl = AclBlock::new(kp.public().clone(), true);
        acl.grant(reader.public().clone(), true, false, false);
        acl.set_payload(b"acl".to_vec());
        acl.seal(&kp).unwrap();

        let blocks = [
            Block::Immutable(ImmutableBlock::new(b"imm".to_vec(), Some(kp.public().clone()))),
            Block::Mutable(mutable),
            Block::Acl(acl),
            Block::Named(NamedBlock::new(&kp, b"root".to_vec(), b"named".to_vec())),
        ];
        for block in &blocks {
            let bytes = block.to_wire(Version::CURRENT).unwrap();
            let back = Block::from_wire(&bytes).unwrap();
            assert_eq!(&back, block);
            assert_eq!(back.to_wire(Version::CURRENT).unwrap(), bytes);
            assert!(back.validate().is_ok());

            let json = block.to_json();
            let from_json = Block::from_json(&json).unwrap();
            assert_eq!(&from_json, block);
        }
    }

    #[test]
    fn old_wire_format_roundtrip() {
        let kp = KeyPair::generate();
        let block = Block::Immutable(ImmutableBlock::with_salt(
            b"payload".to_vec(),
            Some(kp.public().clone()),
            Vec::new(),
        ));
        let old = Version::new(0, 1, 0);
        let bytes = block.to_wire(old).unwrap();
        let back = Block::from_wire(&bytes).unwrap();
        assert_eq!(back, block);
        // Re-serializing at the old version reproduces the old bytes.
        assert_eq!(back.to_wire(old).unwrap(), bytes);
    }

    #[test]
    fn remove_signature_rules() {
        let owner = KeyPair::generate();
        let stranger = KeyPair::generate();

        let anon = Block::Immutable(ImmutableBlock::new(b"x".to_vec(), None));
        let rs = anon.sign_remove(&stranger).unwrap();
        assert!(anon.check_remove(&rs, false).is_ok());

        let owned = Block::Immutable(ImmutableBlock::new(b"x".to_vec(), Some(owner.public().clone())));
        assert!(matches!(owned.sign_remove(&stranger), Err(Error::PermissionDenied)));
        let rs = owned.sign_remove(&owner).unwrap();
        assert!(owned.check_remove(&rs, false).is_ok());

        // A removal signed for a different block does not transfer.
        let other = Block::Immutable(ImmutableBlock::new(b"y".to_vec(), Some(owner.public().clone())));
        let rs_other = other.sign_remove(&owner).unwrap();
        assert!(owned.check_remove(&rs_other, false).is_err());
    }

    #[test]
    fn anonymous_named_removal_is_a_policy_knob() {
        let block = Block::Named(NamedBlock::anonymous(b"name".to_vec(), b"v".to_vec()));
        let rs = RemoveSignature::anonymous(block.address());
        assert!(matches!(block.check_remove(&rs, false), Err(Error::PermissionDenied)));
        assert!(block.check_remove(&rs, true).is_ok());
    }

    #[test]
    fn acl_writer_may_sign_removal() {
        let owner = KeyPair::generate();
        let writer = KeyPair::generate();
        let reader = KeyPair::generate();

        let mut acl = AclBlock::new(owner.public().clone(), true);
        acl.grant(writer.public().clone(), true, true, false);
        acl.grant(reader.public().clone(), true, false, false);
        acl.set_payload(b"data".to_vec());
        acl.seal(&owner).unwrap();
        let block = Block::Acl(acl);

        let rs = block.sign_remove(&writer).unwrap();
        assert!(block.check_remove(&rs, false).is_ok());
        assert!(matches!(block.sign_remove(&reader), Err(Error::PermissionDenied)));
    }
}
