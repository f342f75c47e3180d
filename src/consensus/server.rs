//! The consensus server: hosts one Paxos acceptor per locally owned
//! mutable address, persists every decision through the silo, and serves
//! the peer-facing block operations.
//!
//! All state transitions for one address run under that address's async
//! mutex, held across silo suspensions. The in-memory decision cache is
//! a bounded LRU; the silo record is the source of truth, so eviction is
//! just forgetting.

use super::paxos::{Acceptor, GetResponse, PaxosError, PromiseResponse, Proposal, Quorum, Value};
use crate::address::{Address, AddressKind};
use crate::blocks::{Block, RemoveSignature, StoreMode, TAG_PAXOS};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::silo::{Silo, SiloError};
use crate::wire;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, trace};

/// Decisions kept in memory before the LRU forgets the coldest.
const DECISION_CACHE_SIZE: usize = 1024;

// =============================================================================
// PER-ADDRESS LOCKS
// =============================================================================

/// Async mutex per address, held across suspensions. Entries whose Arc is
/// no longer shared are dropped opportunistically on the next acquire.
struct AddressLocks {
    map: Mutex<HashMap<Address, Arc<tokio::sync::Mutex<()>>>>,
}

impl AddressLocks {
    fn new() -> Self {
        Self { map: Mutex::new(HashMap::new()) }
    }

    async fn acquire(&self, address: Address) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.map.lock().expect("address locks poisoned");
            // Drop locks with no waiters left.
            map.retain(|_, l| Arc::strong_count(l) > 1);
            map.entry(address)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

// =============================================================================
// DECISION CACHE
// =============================================================================

struct DecisionCache {
    entries: HashMap<Address, (u64, Acceptor)>,
    tick: u64,
}

impl DecisionCache {
    fn new() -> Self {
        Self { entries: HashMap::new(), tick: 0 }
    }

    fn get(&mut self, address: &Address) -> Option<Acceptor> {
        self.tick += 1;
        let tick = self.tick;
        self.entries.get_mut(address).map(|(use_at, acceptor)| {
            *use_at = tick;
            acceptor.clone()
        })
    }

    fn put(&mut self, address: Address, acceptor: Acceptor) {
        self.tick += 1;
        self.entries.insert(address, (self.tick, acceptor));
        if self.entries.len() > DECISION_CACHE_SIZE {
            if let Some(coldest) =
                self.entries.iter().min_by_key(|(_, (t, _))| *t).map(|(a, _)| *a)
            {
                self.entries.remove(&coldest);
            }
        }
    }

    fn remove(&mut self, address: &Address) {
        self.entries.remove(address);
    }
}

// =============================================================================
// SERVER
// =============================================================================

/// What one local address holds: a paxos decision or a plain immutable
/// block.
enum Stored {
    Paxos(Acceptor),
    Block(Block),
    Nothing,
}

pub struct ConsensusServer {
    ctx: Arc<Context>,
    silo: Arc<dyn Silo>,
    locks: AddressLocks,
    cache: Mutex<DecisionCache>,
}

impl ConsensusServer {
    pub fn new(ctx: Arc<Context>, silo: Arc<dyn Silo>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            silo,
            locks: AddressLocks::new(),
            cache: Mutex::new(DecisionCache::new()),
        })
    }

    pub fn silo(&self) -> &Arc<dyn Silo> {
        &self.silo
    }

    // -- storage --------------------------------------------------------------

    async fn load(&self, address: Address) -> Result<Stored> {
        if let Some(acceptor) = self.cache.lock().expect("decision cache poisoned").get(&address)
        {
            return Ok(Stored::Paxos(acceptor));
        }
        let bytes = match self.silo.get(address).await {
            Ok(bytes) => bytes,
            Err(SiloError::MissingKey(_)) => return Ok(Stored::Nothing),
            Err(e) => return Err(Error::other(e)),
        };
        let (_, tag, body) = wire::open_envelope(&bytes).map_err(Error::other)?;
        if tag == TAG_PAXOS {
            let acceptor: Acceptor = wire::from_bytes(body)?;
            self.cache
                .lock()
                .expect("decision cache poisoned")
                .put(address, acceptor.clone());
            Ok(Stored::Paxos(acceptor))
        } else {
            Ok(Stored::Block(Block::from_wire(&bytes).map_err(Error::other)?))
        }
    }

    async fn persist(&self, address: Address, acceptor: &Acceptor) -> Result<()> {
        let bytes = wire::seal_envelope(self.ctx.wire_version(), TAG_PAXOS, acceptor)
            .map_err(Error::other)?;
        self.silo
            .set(address, bytes, false, false)
            .await
            .map_err(Error::other)?;
        self.cache
            .lock()
            .expect("decision cache poisoned")
            .put(address, acceptor.clone());
        Ok(())
    }

    async fn load_acceptor(&self, address: Address) -> Result<Option<Acceptor>> {
        match self.load(address).await? {
            Stored::Paxos(acceptor) => Ok(Some(acceptor)),
            Stored::Block(_) => Err(Error::ValidationFailed(
                "address holds an immutable block, not a paxos state".into(),
            )),
            Stored::Nothing => Ok(None),
        }
    }

    // -- paxos verbs ----------------------------------------------------------

    pub async fn propose(
        &self,
        quorum: &Quorum,
        address: Address,
        proposal: Proposal,
        insert: bool,
    ) -> Result<PromiseResponse> {
        let _guard = self.locks.acquire(address).await;
        let mut acceptor = match self.load_acceptor(address).await? {
            Some(acceptor) => {
                if insert && acceptor.has_chosen() {
                    return Err(PaxosError::AlreadyExists.into());
                }
                acceptor
            }
            None if insert => Acceptor::new(quorum.clone()),
            None => return Err(PaxosError::NotFound.into()),
        };
        trace!(?address, %proposal, insert, "propose");
        let response = acceptor.propose(quorum, proposal).map_err(Error::Paxos)?;
        self.persist(address, &acceptor).await?;
        Ok(response)
    }

    pub async fn accept(
        &self,
        quorum: &Quorum,
        address: Address,
        proposal: Proposal,
        value: Value,
    ) -> Result<()> {
        if self.ctx.config.validate_signatures {
            if let Value::Block(block) = &value {
                block.validate_at(&address)?;
            }
        }
        let _guard = self.locks.acquire(address).await;
        let mut acceptor = self
            .load_acceptor(address)
            .await?
            .ok_or(Error::Paxos(PaxosError::NotFound))?;
        trace!(?address, %proposal, "accept");
        acceptor.accept(quorum, proposal, value).map_err(Error::Paxos)?;
        self.persist(address, &acceptor).await
    }

    pub async fn confirm(
        &self,
        quorum: &Quorum,
        address: Address,
        proposal: Proposal,
    ) -> Result<()> {
        let _guard = self.locks.acquire(address).await;
        let mut acceptor = self
            .load_acceptor(address)
            .await?
            .ok_or(Error::Paxos(PaxosError::NotFound))?;
        trace!(?address, %proposal, "confirm");
        acceptor.confirm(quorum, proposal).map_err(Error::Paxos)?;
        self.persist(address, &acceptor).await
    }

    pub async fn get(
        &self,
        address: Address,
        local_version: Option<u64>,
    ) -> Result<GetResponse> {
        let _guard = self.locks.acquire(address).await;
        let acceptor = self
            .load_acceptor(address)
            .await?
            .ok_or(Error::MissingBlock(address))?;
        Ok(acceptor.get(local_version))
    }

    /// Adopt a chosen block pushed after a membership change.
    pub async fn propagate(
        &self,
        quorum: &Quorum,
        block: Block,
        proposal: Proposal,
    ) -> Result<()> {
        let address = block.address();
        if self.ctx.config.validate_signatures {
            block.validate_at(&address)?;
        }
        let _guard = self.locks.acquire(address).await;
        let mut acceptor = match self.load_acceptor(address).await? {
            Some(acceptor) => acceptor,
            None => Acceptor::new(quorum.clone()),
        };
        debug!(?address, "adopting propagated block");
        acceptor.learn(quorum.clone(), block, proposal);
        self.persist(address, &acceptor).await
    }

    /// Replica self-check: does this peer hold a confirmed value?
    pub async fn reconcile(&self, address: Address) -> Result<bool> {
        let _guard = self.locks.acquire(address).await;
        match self.load(address).await? {
            Stored::Paxos(acceptor) => Ok(acceptor.has_chosen()),
            Stored::Block(_) => Ok(true),
            Stored::Nothing => Ok(false),
        }
    }

    // -- block operations -----------------------------------------------------

    /// Direct store: the immutable short-circuit. Mutable blocks must go
    /// through a paxos round.
    pub async fn store(&self, block: Block, mode: StoreMode) -> Result<()> {
        let address = block.address();
        if address.kind() == AddressKind::Mutable {
            return Err(Error::ValidationFailed(
                "mutable blocks are stored through consensus".into(),
            ));
        }
        if self.ctx.config.validate_signatures {
            block.validate_at(&address)?;
        }
        let bytes = block
            .to_wire(self.ctx.wire_version())
            .map_err(Error::other)?;
        let (insert, update) = match mode {
            StoreMode::Insert => (true, false),
            StoreMode::Update => (false, true),
        };
        match self.silo.set(address, bytes, insert, update).await {
            Ok(_) => Ok(()),
            Err(SiloError::Collision(a)) => Err(Error::Collision(a)),
            Err(SiloError::MissingKey(a)) => Err(Error::MissingBlock(a)),
            Err(e) => Err(Error::other(e)),
        }
    }

    /// Local fetch. Only confirmed values are observable; `Ok(None)` is
    /// the not-modified sentinel.
    pub async fn fetch(
        &self,
        address: Address,
        local_version: Option<u64>,
    ) -> Result<Option<Block>> {
        match self.load(address).await? {
            Stored::Block(block) => Ok(Some(block)),
            Stored::Paxos(acceptor) => {
                if let (Some(local), Some(chosen)) = (local_version, acceptor.chosen_version()) {
                    if chosen <= local {
                        return Ok(None);
                    }
                }
                acceptor
                    .chosen_block()
                    .cloned()
                    .map(Some)
                    .ok_or(Error::MissingBlock(address))
            }
            Stored::Nothing => Err(Error::MissingBlock(address)),
        }
    }

    pub async fn remove(&self, address: Address, signature: RemoveSignature) -> Result<()> {
        let _guard = self.locks.acquire(address).await;
        let block = match self.load(address).await? {
            Stored::Block(block) => block,
            Stored::Paxos(acceptor) => acceptor
                .chosen_block()
                .cloned()
                .ok_or(Error::MissingBlock(address))?,
            Stored::Nothing => return Err(Error::MissingBlock(address)),
        };
        if self.ctx.config.validate_signatures {
            block.check_remove(&signature, self.ctx.config.allow_anonymous_named_removal)?;
        }
        self.silo.erase(address).await.map_err(|e| match e {
            SiloError::MissingKey(a) => Error::MissingBlock(a),
            other => Error::other(other),
        })?;
        self.cache.lock().expect("decision cache poisoned").remove(&address);
        debug!(?address, "removed block");
        Ok(())
    }

    // -- inspection -----------------------------------------------------------

    /// Scan local records: every mutable address with its quorum, for the
    /// startup under-replication pass.
    pub async fn repartition(&self) -> Result<Vec<(Address, Quorum)>> {
        let mut out = Vec::new();
        for address in self.silo.list().await.map_err(Error::other)? {
            if address.kind() != AddressKind::Mutable {
                continue;
            }
            if let Ok(Some(acceptor)) = self.load_acceptor(address).await {
                out.push((address, acceptor.quorum().clone()));
            }
        }
        Ok(out)
    }

    /// Current quorum of one local address.
    pub async fn quorum_of(&self, address: Address) -> Result<Quorum> {
        let acceptor = self
            .load_acceptor(address)
            .await?
            .ok_or(Error::MissingBlock(address))?;
        Ok(acceptor.quorum().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{ImmutableBlock, MutableBlock};
    use crate::config::NodeConfig;
    use crate::crypto::KeyPair;
    use crate::passport::{Capabilities, Passport};
    use crate::silo::MemorySilo;
    use crate::NodeId;

    fn server() -> (Arc<ConsensusServer>, KeyPair) {
        let owner = KeyPair::generate();
        let keys = KeyPair::generate();
        let passport = Passport::issue(
            &owner,
            keys.public().clone(),
            "burrow",
            Capabilities::default(),
        );
        let ctx = Arc::new(Context::new(
            NodeId::random(),
            keys.clone(),
            owner.public().clone(),
            passport,
            NodeConfig::default(),
        ));
        (ConsensusServer::new(ctx, Arc::new(MemorySilo::new(None))), keys)
    }

    fn quorum(server: &ConsensusServer) -> Quorum {
        [server.ctx.id].into_iter().collect()
    }

    #[tokio::test]
    async fn paxos_round_survives_cache_eviction() {
        let (server, keys) = server();
        let q = quorum(&server);
        let mut block = MutableBlock::new(keys.public().clone());
        block.set_payload(b"payload".to_vec());
        block.seal(&keys).unwrap();
        let block = Block::Mutable(block);
        let address = block.address();

        let p = Proposal::new(1, server.ctx.id);
        server.propose(&q, address, p, true).await.unwrap();
        server.accept(&q, address, p, Value::Block(block.clone())).await.unwrap();
        server.confirm(&q, address, p).await.unwrap();

        // Forget the cache; the silo record must be enough.
        server.cache.lock().unwrap().remove(&address);
        let fetched = server.fetch(address, None).await.unwrap().unwrap();
        assert_eq!(fetched, block);
        assert!(server.reconcile(address).await.unwrap());
    }

    #[tokio::test]
    async fn unconfirmed_values_are_not_observable() {
        let (server, keys) = server();
        let q = quorum(&server);
        let mut block = MutableBlock::new(keys.public().clone());
        block.set_payload(b"pending".to_vec());
        block.seal(&keys).unwrap();
        let block = Block::Mutable(block);
        let address = block.address();

        let p = Proposal::new(1, server.ctx.id);
        server.propose(&q, address, p, true).await.unwrap();
        server.accept(&q, address, p, Value::Block(block)).await.unwrap();
        // No confirm: fetch must not expose the accepted value.
        assert!(matches!(
            server.fetch(address, None).await,
            Err(Error::MissingBlock(_))
        ));
        assert!(!server.reconcile(address).await.unwrap());
    }

    #[tokio::test]
    async fn immutable_short_circuit_and_collision() {
        let (server, keys) = server();
        let block = Block::Immutable(ImmutableBlock::new(
            b"content".to_vec(),
            Some(keys.public().clone()),
        ));
        let address = block.address();

        server.store(block.clone(), StoreMode::Insert).await.unwrap();
        assert!(matches!(
            server.store(block.clone(), StoreMode::Insert).await,
            Err(Error::Collision(_))
        ));
        assert_eq!(server.fetch(address, None).await.unwrap().unwrap(), block);

        let rs = block.sign_remove(&keys).unwrap();
        server.remove(address, rs).await.unwrap();
        assert!(matches!(
            server.fetch(address, None).await,
            Err(Error::MissingBlock(_))
        ));
    }

    #[tokio::test]
    async fn removal_requires_a_valid_signature() {
        let (server, keys) = server();
        let stranger = KeyPair::generate();
        let block = Block::Immutable(ImmutableBlock::new(
            b"guarded".to_vec(),
            Some(keys.public().clone()),
        ));
        let address = block.address();
        server.store(block.clone(), StoreMode::Insert).await.unwrap();

        // A stranger cannot even produce a signature; a forged anonymous
        // removal is rejected at check time.
        assert!(block.sign_remove(&stranger).is_err());
        let forged = RemoveSignature::anonymous(address);
        assert!(server.remove(address, forged).await.is_err());
    }

    #[tokio::test]
    async fn repartition_lists_mutable_addresses() {
        let (server, keys) = server();
        let q = quorum(&server);
        let mut block = MutableBlock::new(keys.public().clone());
        block.set_payload(b"x".to_vec());
        block.seal(&keys).unwrap();
        let block = Block::Mutable(block);
        let address = block.address();

        let p = Proposal::new(1, server.ctx.id);
        server.propose(&q, address, p, true).await.unwrap();
        server.accept(&q, address, p, Value::Block(block)).await.unwrap();
        server.confirm(&q, address, p).await.unwrap();

        let parts = server.repartition().await.unwrap();
        assert_eq!(parts, vec![(address, q)]);
    }
}
