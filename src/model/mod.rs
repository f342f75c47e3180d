//! The model façade: typed block operations over consensus.
//!
//! Construction seals blocks with correctly derived addresses; writes
//! drive Paxos and feed conflicts through the caller's resolver with a
//! bounded retry budget; reads validate and optionally decrypt.

pub mod resolver;

pub use resolver::{
    from_serialized, squash_stack, ConflictResolver, DummyResolver, MergeResolver,
    SerializedResolver, SquashDecision,
};

use crate::address::Address;
use crate::blocks::{
    AclBlock, Block, ImmutableBlock, MutableBlock, NamedBlock, RemoveSignature, StoreMode,
};
use crate::consensus::Consensus;
use crate::context::Context;
use crate::crypto::PublicKey;
use crate::error::{Error, Result};
use std::sync::Arc;
use tracing::{debug, trace};

pub struct Model {
    ctx: Arc<Context>,
    consensus: Arc<Consensus>,
}

impl Model {
    pub fn new(ctx: Arc<Context>, consensus: Arc<Consensus>) -> Self {
        Self { ctx, consensus }
    }

    pub fn consensus(&self) -> &Arc<Consensus> {
        &self.consensus
    }

    // =========================================================================
    // CONSTRUCTORS
    // =========================================================================

    /// Fresh owned mutable block; sealed on first write.
    pub fn make_mutable_block(&self) -> Block {
        Block::Mutable(MutableBlock::new(self.ctx.keys.public().clone()))
    }

    /// Content block. A null owner makes it removable by anyone.
    pub fn make_immutable_block(&self, data: Vec<u8>, owner: Option<PublicKey>) -> Block {
        Block::Immutable(ImmutableBlock::new(data, owner))
    }

    /// Access-controlled block; at-rest encryption per configuration.
    pub fn make_acl_block(&self) -> Block {
        Block::Acl(AclBlock::new(
            self.ctx.keys.public().clone(),
            self.ctx.config.encrypt_at_rest,
        ))
    }

    /// Well-known reference published under `H(owner ∥ name)`.
    pub fn make_named_block(&self, name: &[u8], data: Vec<u8>) -> Block {
        Block::Named(NamedBlock::new(&self.ctx.keys, name.to_vec(), data))
    }

    /// Where `make_named_block(name, ..)` will land, without building it.
    pub fn named_block_address(&self, name: &[u8]) -> Address {
        Address::for_name(Some(self.ctx.keys.public()), name)
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Insert a new block, sealing it first if needed.
    pub async fn insert(
        &self,
        block: Block,
        resolver: Option<Box<dyn ConflictResolver>>,
    ) -> Result<Address> {
        let address = block.address();
        trace!(?address, "insert");
        self.write(block, StoreMode::Insert, resolver, false).await?;
        Ok(address)
    }

    /// Update an existing mutable block. On conflict the resolver merges
    /// against the winner; `decrypt` hands it the winner's plaintext.
    pub async fn update(
        &self,
        block: Block,
        resolver: Option<Box<dyn ConflictResolver>>,
        decrypt: bool,
    ) -> Result<()> {
        trace!(address = ?block.address(), "update");
        self.write(block, StoreMode::Update, resolver, decrypt).await
    }

    async fn write(
        &self,
        mut block: Block,
        mode: StoreMode,
        resolver: Option<Box<dyn ConflictResolver>>,
        decrypt: bool,
    ) -> Result<()> {
        if !block.is_sealed() {
            block.seal(&self.ctx.keys)?;
        }
        let retries = resolver.as_ref().map(|r| r.max_retries()).unwrap_or(0);
        let mut attempt = 0u32;
        loop {
            match self.consensus.store(block.clone(), mode).await {
                Ok(()) => return Ok(()),
                Err(Error::Conflict { version, current }) => {
                    let Some(resolver) = resolver.as_ref() else {
                        return Err(Error::Conflict { version, current });
                    };
                    if attempt >= retries {
                        debug!(
                            address = ?block.address(),
                            attempts = attempt,
                            "resolver retry budget exhausted"
                        );
                        return Err(Error::Conflict { version, current });
                    }
                    attempt += 1;
                    let current = match current {
                        Some(current) => *current,
                        // The winner is not readable here (e.g. an insert
                        // collision before any confirm reached us); retry
                        // the round and let consensus surface it again.
                        None => continue,
                    };
                    let current_plain = if decrypt {
                        self.decrypt_with_own_keys(&current).ok()
                    } else {
                        None
                    };
                    debug!(
                        address = ?block.address(),
                        winner_version = version,
                        via = %resolver.description(),
                        "conflict, merging"
                    );
                    let mut merged =
                        resolver.resolve(block, &current, current_plain.as_deref())?;
                    if !merged.is_sealed() {
                        merged.seal(&self.ctx.keys)?;
                    }
                    block = merged;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Current value of an address, validated. `Ok(None)` when
    /// `local_version` is already current.
    pub async fn fetch(
        &self,
        address: Address,
        local_version: Option<u64>,
    ) -> Result<Option<Block>> {
        self.consensus.fetch(address, local_version).await
    }

    /// Batched fetch; each entry resolves or fails independently.
    pub async fn fetch_many(
        &self,
        addresses: &[crate::peer::AddressVersion],
    ) -> Result<Vec<(Address, Result<Block>)>> {
        self.consensus.fetch_many(addresses).await
    }

    /// Fetch and decrypt with our own keys: `(block, plaintext)`.
    pub async fn fetch_decrypt(
        &self,
        address: Address,
        local_version: Option<u64>,
    ) -> Result<Option<(Block, Vec<u8>)>> {
        match self.consensus.fetch(address, local_version).await? {
            None => Ok(None),
            Some(block) => {
                let plain = self.decrypt_with_own_keys(&block)?;
                Ok(Some((block, plain)))
            }
        }
    }

    fn decrypt_with_own_keys(&self, block: &Block) -> Result<Vec<u8>> {
        block.decrypt(&self.ctx.keys)
    }

    // =========================================================================
    // REMOVAL
    // =========================================================================

    /// Remove a block. Without a caller-supplied signature the block is
    /// fetched and the removal signed with our keys.
    pub async fn remove(
        &self,
        address: Address,
        signature: Option<RemoveSignature>,
    ) -> Result<()> {
        let signature = match signature {
            Some(signature) => signature,
            None => {
                let block = self
                    .fetch(address, None)
                    .await?
                    .ok_or(Error::MissingBlock(address))?;
                block.sign_remove(&self.ctx.keys)?
            }
        };
        trace!(?address, "remove");
        self.consensus.remove(address, signature).await
    }
}
