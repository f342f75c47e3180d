//! Bounded serialization for everything that crosses a trust boundary.
//!
//! All block, RPC and silo payloads are postcard-encoded inside a
//! versioned envelope. Wire collections deserialize through
//! [`BoundedVec`], which enforces its element bound one element at a
//! time: a forged length prefix is caught before it can drive a large
//! allocation. Raw byte payloads need no wrapper of their own — they
//! are capped by the frame limits at the transport layer.

use crate::types::Version;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

/// Outer limit for any serialized block or RPC frame (2 MB).
pub const MAX_PAYLOAD_SIZE: usize = 2 * 1024 * 1024;

/// Entries in one ACL (readers and writers of one block).
pub const MAX_ACL_ENTRIES: usize = 4_000;

/// Nodes in one quorum; far above any sane replication factor.
pub const MAX_QUORUM_NODES: usize = 64;

/// Key ids in one resolve_keys call.
pub const MAX_KEY_IDS: usize = 1_024;

/// Endpoints advertised for one node.
pub const MAX_NODE_ENDPOINTS: usize = 16;

/// Addresses in one fetch_multi call.
pub const MAX_FETCH_ADDRESSES: usize = 1_024;

/// Envelope prefix: version triple + variant tag.
pub const ENVELOPE_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("payload too short for envelope")]
    Truncated,
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(Version),
    #[error("unknown tag {0}")]
    UnknownTag(u8),
    #[error("encoding: {0}")]
    Codec(#[from] postcard::Error),
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// Serialize `value` behind a `[major][minor][patch][tag]` prefix.
pub fn seal_envelope<T: Serialize>(
    version: Version,
    tag: u8,
    value: &T,
) -> Result<Vec<u8>, WireError> {
    let body = postcard::to_allocvec(value)?;
    let mut out = Vec::with_capacity(ENVELOPE_SIZE + body.len());
    out.push(version.major);
    out.push(version.minor);
    out.push(version.patch);
    out.push(tag);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Split an envelope into its version, tag and body. The body may carry
/// trailing bytes added by newer versions; decoders ignore them.
pub fn open_envelope(data: &[u8]) -> Result<(Version, u8, &[u8]), WireError> {
    if data.len() < ENVELOPE_SIZE {
        return Err(WireError::Truncated);
    }
    let version = Version::new(data[0], data[1], data[2]);
    if !version.supported() {
        return Err(WireError::UnsupportedVersion(version));
    }
    Ok((version, data[3], &data[ENVELOPE_SIZE..]))
}

/// Deserialize with postcard; trailing bytes are tolerated.
pub fn from_bytes<'de, T: Deserialize<'de>>(data: &'de [u8]) -> Result<T, postcard::Error> {
    postcard::from_bytes(data)
}

pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, postcard::Error> {
    postcard::to_allocvec(value)
}

// =============================================================================
// BOUNDED COLLECTIONS
// =============================================================================

/// A vector that never deserializes more than `N` elements.
///
/// Serialization is a plain sequence, so the wire shape is identical to
/// `Vec<T>`; only the decoding side differs. The bound is enforced
/// inside the visitor as elements stream in, never trusting the
/// sequence's self-declared length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedVec<T, const N: usize>(Vec<T>);

impl<T, const N: usize> BoundedVec<T, N> {
    /// Wrap a vector, refusing anything over the bound.
    pub fn new(items: Vec<T>) -> Option<Self> {
        (items.len() <= N).then_some(Self(items))
    }

    pub fn into_inner(self) -> Vec<T> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T, const N: usize> std::ops::Deref for BoundedVec<T, N> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.0
    }
}

impl<T: Serialize, const N: usize> Serialize for BoundedVec<T, N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>, const N: usize> Deserialize<'de> for BoundedVec<T, N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // `fn() -> T` keeps the marker Send/Sync regardless of T.
        struct SeqGuard<T, const N: usize>(PhantomData<fn() -> T>);

        impl<'de, T: Deserialize<'de>, const N: usize> de::Visitor<'de> for SeqGuard<T, N> {
            type Value = Vec<T>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a wire sequence of at most {N} elements")
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Vec<T>, A::Error> {
                let mut items: Vec<T> = Vec::new();
                while let Some(item) = seq.next_element::<T>()? {
                    if items.len() == N {
                        return Err(de::Error::custom(format_args!(
                            "wire sequence exceeds its bound of {N} elements"
                        )));
                    }
                    items.push(item);
                }
                Ok(items)
            }
        }

        deserializer
            .deserialize_seq(SeqGuard::<T, N>(PhantomData))
            .map(Self)
    }
}
