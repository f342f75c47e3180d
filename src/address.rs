//! 32-byte block addresses with a type-flag byte.
//!
//! The last byte of every address tells mutable from immutable storage
//! without fetching the block. Immutable and named addresses are derived
//! from content/owner digests with the flag overwriting the final digest
//! byte; mutable addresses are random and stable across updates.

use crate::crypto::{sha3_parts, PublicKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const ADDRESS_SIZE: usize = 32;

/// Flag values stored in the last address byte.
pub const FLAG_MUTABLE: u8 = 0x00;
pub const FLAG_IMMUTABLE: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Mutable,
    Immutable,
}

impl AddressKind {
    pub fn flag(&self) -> u8 {
        match self {
            AddressKind::Mutable => FLAG_MUTABLE,
            AddressKind::Immutable => FLAG_IMMUTABLE,
        }
    }
}

/// Content- or owner-derived 32-byte identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub [u8; ADDRESS_SIZE]);

/// Node identifiers share the address space: a node id is a random
/// mutable-flagged address minted once per node.
pub type NodeId = Address;

impl Address {
    pub const NULL: Address = Address([0u8; ADDRESS_SIZE]);

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn kind(&self) -> AddressKind {
        if self.0[ADDRESS_SIZE - 1] == FLAG_MUTABLE {
            AddressKind::Mutable
        } else {
            AddressKind::Immutable
        }
    }

    pub fn is_mutable(&self) -> bool {
        self.kind() == AddressKind::Mutable
    }

    /// Fresh random mutable address (block allocation, node ids).
    pub fn random() -> Self {
        let mut bytes = [0u8; ADDRESS_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[ADDRESS_SIZE - 1] = FLAG_MUTABLE;
        Self(bytes)
    }

    fn flagged(mut digest: [u8; ADDRESS_SIZE], kind: AddressKind) -> Self {
        digest[ADDRESS_SIZE - 1] = kind.flag();
        Self(digest)
    }

    /// Immutable address: `H(owner ∥ payload ∥ salt)`, null owner hashed
    /// as empty bytes.
    pub fn for_content(owner: Option<&PublicKey>, payload: &[u8], salt: &[u8]) -> Self {
        let owner_digest = owner.map(|k| k.digest()).unwrap_or_default();
        Self::flagged(
            sha3_parts(&[&owner_digest, payload, salt]),
            AddressKind::Immutable,
        )
    }

    /// Named-block address: `H(owner ∥ name)`, independent of the payload.
    pub fn for_name(owner: Option<&PublicKey>, name: &[u8]) -> Self {
        let owner_digest = owner.map(|k| k.digest()).unwrap_or_default();
        Self::flagged(sha3_parts(&[&owner_digest, name]), AddressKind::Immutable)
    }

    /// Mutable address derived from the owner key and an allocation salt.
    pub fn for_owner(owner: &PublicKey, salt: &[u8]) -> Self {
        Self::flagged(sha3_parts(&[&owner.digest(), salt]), AddressKind::Mutable)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps logs readable; the flag byte is the interesting bit.
        write!(
            f,
            "{}..{:02x}",
            hex::encode(&self.0[..4]),
            self.0[ADDRESS_SIZE - 1]
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid address: {0}")]
pub struct AddressParseError(String);

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| AddressParseError(e.to_string()))?;
        let arr: [u8; ADDRESS_SIZE] = bytes
            .try_into()
            .map_err(|_| AddressParseError("expected 32 bytes".into()))?;
        Ok(Self(arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn flags() {
        let a = Address::random();
        assert!(a.is_mutable());
        assert!(!a.is_null());
        assert!(Address::NULL.is_null());
    }

    #[test]
    fn content_address_depends_on_all_parts() {
        let kp = KeyPair::generate();
        let a = Address::for_content(Some(kp.public()), b"payload", b"salt");
        assert_eq!(a.kind(), AddressKind::Immutable);
        assert_eq!(a, Address::for_content(Some(kp.public()), b"payload", b"salt"));
        assert_ne!(a, Address::for_content(Some(kp.public()), b"payload", b"other"));
        assert_ne!(a, Address::for_content(None, b"payload", b"salt"));
    }

    #[test]
    fn named_address_ignores_payload() {
        let kp = KeyPair::generate();
        let a = Address::for_name(Some(kp.public()), b"root");
        let b = Address::for_name(Some(kp.public()), b"root");
        assert_eq!(a, b);
        assert_ne!(a, Address::for_name(Some(kp.public()), b"home"));
    }

    #[test]
    fn hex_roundtrip() {
        let a = Address::random();
        let parsed: Address = a.to_string().parse().unwrap();
        assert_eq!(a, parsed);
        assert!("zz".parse::<Address>().is_err());
    }
}
