//! Conflict resolvers: how a losing write merges with the winner.
//!
//! A resolver is a typed callable plus a squash decision and a human
//! description. Resolvers serialize as `(tag, payload)` tuples so a
//! pending merge can be journaled and replayed; no closures end up in
//! persisted state.

use crate::blocks::Block;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Whether a follow-up conflict folds into the previous resolver without
/// user intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SquashDecision {
    Stop,
    Squash,
}

/// Journaled resolver form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedResolver {
    pub tag: String,
    pub payload: Vec<u8>,
}

pub trait ConflictResolver: Send + Sync {
    /// Merge the losing proposal onto the current winner. The result
    /// must be rebased on `current.version()`; it is re-sealed and
    /// retried by the façade.
    fn resolve(
        &self,
        proposed: Block,
        current: &Block,
        current_plain: Option<&[u8]>,
    ) -> Result<Block>;

    /// Decide against the stack of resolvers already applied.
    fn squashable(&self, _stack: &[SerializedResolver]) -> SquashDecision {
        SquashDecision::Stop
    }

    fn description(&self) -> String;

    fn serialize(&self) -> SerializedResolver;

    /// Retry bound the façade honors on repeated conflicts.
    fn max_retries(&self) -> u32 {
        crate::config::DEFAULT_CONFLICT_RETRIES
    }
}

// =============================================================================
// DUMMY
// =============================================================================

/// Last-writer-wins: keep the proposed payload, discard the concurrent
/// change, land on top of the current version.
pub struct DummyResolver;

impl ConflictResolver for DummyResolver {
    fn resolve(
        &self,
        mut proposed: Block,
        current: &Block,
        _current_plain: Option<&[u8]>,
    ) -> Result<Block> {
        proposed.rebase(current.version())?;
        Ok(proposed)
    }

    fn squashable(&self, _stack: &[SerializedResolver]) -> SquashDecision {
        // Overwriting again changes nothing about the outcome.
        SquashDecision::Squash
    }

    fn description(&self) -> String {
        "overwrite the concurrent change".into()
    }

    fn serialize(&self) -> SerializedResolver {
        SerializedResolver { tag: "dummy".into(), payload: Vec::new() }
    }
}

// =============================================================================
// MERGE
// =============================================================================

/// Ordered chain of sub-resolvers, each applied to the previous result.
pub struct MergeResolver {
    inner: Vec<Box<dyn ConflictResolver>>,
}

impl MergeResolver {
    pub fn new(inner: Vec<Box<dyn ConflictResolver>>) -> Self {
        Self { inner }
    }

    pub fn push(&mut self, resolver: Box<dyn ConflictResolver>) {
        self.inner.push(resolver);
    }
}

impl ConflictResolver for MergeResolver {
    fn resolve(
        &self,
        proposed: Block,
        current: &Block,
        current_plain: Option<&[u8]>,
    ) -> Result<Block> {
        let mut merged = proposed;
        for resolver in &self.inner {
            merged = resolver.resolve(merged, current, current_plain)?;
        }
        merged.rebase(current.version())?;
        Ok(merged)
    }

    fn squashable(&self, stack: &[SerializedResolver]) -> SquashDecision {
        // Merges fold into a previous merge; anything else stops.
        match stack.last() {
            Some(last) if last.tag == "merge" => SquashDecision::Squash,
            _ => SquashDecision::Stop,
        }
    }

    fn description(&self) -> String {
        let parts: Vec<String> = self.inner.iter().map(|r| r.description()).collect();
        format!("merge of [{}]", parts.join(", "))
    }

    fn serialize(&self) -> SerializedResolver {
        let inner: Vec<SerializedResolver> = self.inner.iter().map(|r| r.serialize()).collect();
        SerializedResolver {
            tag: "merge".into(),
            payload: crate::wire::to_bytes(&inner).unwrap_or_default(),
        }
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Rebuild a resolver from its journaled form. Domain resolvers live in
/// client crates and register nothing here; unknown tags are surfaced.
pub fn from_serialized(serialized: &SerializedResolver) -> Result<Box<dyn ConflictResolver>> {
    match serialized.tag.as_str() {
        "dummy" => Ok(Box::new(DummyResolver)),
        "merge" => {
            let inner: Vec<SerializedResolver> = crate::wire::from_bytes(&serialized.payload)?;
            let inner = inner
                .iter()
                .map(from_serialized)
                .collect::<Result<Vec<_>>>()?;
            Ok(Box::new(MergeResolver::new(inner)))
        }
        other => Err(Error::other(format!("unknown resolver tag {other:?}"))),
    }
}

/// Fold `next` onto `previous` when `next` agrees to squash, otherwise
/// keep them chained explicitly.
pub fn squash_stack(
    previous: Box<dyn ConflictResolver>,
    next: Box<dyn ConflictResolver>,
) -> Box<dyn ConflictResolver> {
    match next.squashable(&[previous.serialize()]) {
        SquashDecision::Squash => Box::new(MergeResolver::new(vec![previous, next])),
        SquashDecision::Stop => next,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::MutableBlock;
    use crate::crypto::KeyPair;

    fn sealed(keys: &KeyPair, payload: &[u8], seals: u64) -> Block {
        let mut b = MutableBlock::new(keys.public().clone());
        for _ in 0..seals {
            b.set_payload(payload.to_vec());
            b.seal(keys).unwrap();
        }
        Block::Mutable(b)
    }

    #[test]
    fn dummy_rebases_onto_the_winner() {
        let keys = KeyPair::generate();
        let proposed = sealed(&keys, b"mine", 2);
        let current = sealed(&keys, b"theirs", 6);

        let merged = DummyResolver.resolve(proposed, &current, None).unwrap();
        assert_eq!(merged.version(), 6);
        assert_eq!(merged.data(), b"mine");
        assert!(!merged.is_sealed());
    }

    #[test]
    fn merge_applies_sub_resolvers_in_order() {
        let keys = KeyPair::generate();
        let proposed = sealed(&keys, b"mine", 1);
        let current = sealed(&keys, b"theirs", 3);

        let merge = MergeResolver::new(vec![Box::new(DummyResolver), Box::new(DummyResolver)]);
        let merged = merge.resolve(proposed, &current, None).unwrap();
        assert_eq!(merged.version(), 3);
        assert_eq!(merged.data(), b"mine");
    }

    #[test]
    fn serialization_roundtrip() {
        let merge = MergeResolver::new(vec![Box::new(DummyResolver)]);
        let serialized = merge.serialize();
        assert_eq!(serialized.tag, "merge");
        let rebuilt = from_serialized(&serialized).unwrap();
        assert_eq!(rebuilt.description(), merge.description());

        assert!(from_serialized(&SerializedResolver {
            tag: "directory-edit".into(),
            payload: Vec::new()
        })
        .is_err());
    }

    #[test]
    fn squash_decisions() {
        let dummy = DummyResolver;
        assert_eq!(dummy.squashable(&[]), SquashDecision::Squash);

        let merge = MergeResolver::new(vec![]);
        assert_eq!(
            merge.squashable(&[SerializedResolver { tag: "merge".into(), payload: vec![] }]),
            SquashDecision::Squash
        );
        assert_eq!(
            merge.squashable(&[SerializedResolver { tag: "dummy".into(), payload: vec![] }]),
            SquashDecision::Stop
        );

        let folded = squash_stack(Box::new(DummyResolver), Box::new(MergeResolver::new(vec![])));
        assert!(folded.description().starts_with("merge of"));
    }
}
