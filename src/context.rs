//! Per-node context threaded through the core.
//!
//! No global state: identity, passport, configuration and the key cache
//! travel together as one value handed to every component.

use crate::address::NodeId;
use crate::config::NodeConfig;
use crate::crypto::{KeyPair, PublicKey};
use crate::passport::Passport;
use crate::types::Version;
use std::collections::HashMap;
use std::sync::RwLock;

/// Process-wide cache of public keys by short hash. Blocks and RPCs
/// reference keys by their 8-byte hash; the full 3 KB of key material is
/// transferred once per peer and looked up here afterwards.
#[derive(Debug, Default)]
pub struct KeyCache {
    keys: RwLock<HashMap<u64, PublicKey>>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key; returns its short-hash id.
    pub fn ensure(&self, key: &PublicKey) -> u64 {
        let id = key.short_hash();
        self.keys
            .write()
            .expect("key cache poisoned")
            .entry(id)
            .or_insert_with(|| key.clone());
        id
    }

    pub fn resolve(&self, id: u64) -> Option<PublicKey> {
        self.keys.read().expect("key cache poisoned").get(&id).cloned()
    }

    /// Ids not yet present, preserving order.
    pub fn missing(&self, ids: &[u64]) -> Vec<u64> {
        let keys = self.keys.read().expect("key cache poisoned");
        ids.iter().copied().filter(|id| !keys.contains_key(id)).collect()
    }

    pub fn all(&self) -> Vec<PublicKey> {
        self.keys.read().expect("key cache poisoned").values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.keys.read().expect("key cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a component needs to know about the node it runs in.
pub struct Context {
    /// Stable node identifier, minted at first start.
    pub id: NodeId,
    /// This node's identity keys.
    pub keys: KeyPair,
    /// Network owner public key; the trust root for passports.
    pub owner: PublicKey,
    /// Our own membership claim.
    pub passport: Passport,
    pub config: NodeConfig,
    pub key_cache: KeyCache,
}

impl Context {
    pub fn new(
        id: NodeId,
        keys: KeyPair,
        owner: PublicKey,
        passport: Passport,
        config: NodeConfig,
    ) -> Self {
        let key_cache = KeyCache::new();
        key_cache.ensure(keys.public());
        key_cache.ensure(&owner);
        Self { id, keys, owner, passport, config, key_cache }
    }

    pub fn wire_version(&self) -> Version {
        self.config.wire_version()
    }

    /// Verify a remote's passport against the network owner.
    pub fn verify_passport(
        &self,
        passport: &Passport,
        require_write: bool,
        require_storage: bool,
    ) -> bool {
        passport.network == self.config.network
            && passport
                .verify(&self.owner, require_write, require_storage, false)
                .is_ok()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("network", &self.config.network)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passport::Capabilities;

    fn test_context() -> Context {
        let owner = KeyPair::generate();
        let keys = KeyPair::generate();
        let passport = Passport::issue(
            &owner,
            keys.public().clone(),
            "burrow",
            Capabilities::default(),
        );
        Context::new(
            NodeId::random(),
            keys,
            owner.public().clone(),
            passport,
            NodeConfig::default(),
        )
    }

    #[test]
    fn key_cache_resolves_registered_keys() {
        let ctx = test_context();
        let other = KeyPair::generate();
        let id = ctx.key_cache.ensure(other.public());
        assert_eq!(ctx.key_cache.resolve(id).as_ref(), Some(other.public()));
        assert_eq!(ctx.key_cache.missing(&[id, 0xdead_beef]), vec![0xdead_beef]);
    }

    #[test]
    fn own_passport_verifies() {
        let ctx = test_context();
        let passport = ctx.passport.clone();
        assert!(ctx.verify_passport(&passport, true, true));

        let mut foreign = passport;
        foreign.network = "elsewhere".into();
        assert!(!ctx.verify_passport(&foreign, false, false));
    }
}
