//! Consensus: the client side of per-address Paxos, plus the background
//! machinery that keeps replication converging — auto-expand, startup
//! inspection, eviction of silent peers, graceful resign.
//!
//! Immutable blocks short-circuit the protocol: insertion writes to every
//! allocated owner and removal is a signature check. Everything mutable
//! runs propose/accept/confirm rounds against the block's quorum;
//! membership changes are ordinary rounds whose value is the new quorum,
//! so a rebalance and a user write race under the same proposal order.

pub mod paxos;
pub mod server;

use crate::address::{Address, AddressKind, NodeId};
use crate::blocks::{Block, RemoveSignature, StoreMode};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::overlay::{Overlay, OverlayEvent};
use crate::peer::{LocalPeer, Peer};
use paxos::{majority, Accepted, PaxosError, Proposal, Quorum, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

/// Paxos rounds attempted before a write reports `TooFewPeers`.
const MAX_ROUNDS: u32 = 8;

/// Randomized pause between duelling rounds so two proposers in
/// lockstep stop preempting each other.
async fn round_jitter() {
    let ms = rand::Rng::gen_range(&mut rand::thread_rng(), 1..25);
    tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
}

pub struct Consensus {
    ctx: Arc<Context>,
    overlay: Arc<dyn Overlay>,
    /// Present on storage nodes; observers drive rounds remotely only.
    local: Option<Arc<LocalPeer>>,
    round: AtomicU64,
    rebalance_tx: mpsc::Sender<Address>,
    /// Emitted when a shortfall has no available substitute.
    under_replicated: broadcast::Sender<(Address, usize)>,
    /// Emitted after a successful membership change (tests listen here).
    rebalanced: broadcast::Sender<Address>,
    /// Pending eviction countdowns per silent peer.
    evictions: Mutex<HashMap<NodeId, tokio::task::JoinHandle<()>>>,
}

impl Consensus {
    pub fn new(
        ctx: Arc<Context>,
        overlay: Arc<dyn Overlay>,
        local: Option<Arc<LocalPeer>>,
    ) -> Arc<Self> {
        let (rebalance_tx, rebalance_rx) = mpsc::channel(1024);
        let (under_replicated, _) = broadcast::channel(256);
        let (rebalanced, _) = broadcast::channel(256);
        let consensus = Arc::new(Self {
            ctx,
            overlay,
            local,
            round: AtomicU64::new(1),
            rebalance_tx,
            under_replicated,
            rebalanced,
            evictions: Mutex::new(HashMap::new()),
        });
        consensus.clone().spawn_rebalancer(rebalance_rx);
        consensus.clone().spawn_churn_watcher();
        if consensus.ctx.config.rebalance_inspect {
            consensus.clone().spawn_inspect();
        }
        consensus
    }

    pub fn subscribe_under_replicated(&self) -> broadcast::Receiver<(Address, usize)> {
        self.under_replicated.subscribe()
    }

    pub fn subscribe_rebalanced(&self) -> broadcast::Receiver<Address> {
        self.rebalanced.subscribe()
    }

    fn replication_factor(&self) -> usize {
        self.ctx.config.replication_factor.max(1)
    }

    /// Next proposal strictly above anything we have seen.
    fn next_proposal(&self, above: Option<u64>) -> Proposal {
        let mut round = self.round.fetch_add(1, Ordering::SeqCst);
        if let Some(above) = above {
            while round <= above {
                let bumped = self.round.fetch_max(above + 1, Ordering::SeqCst).max(above + 1);
                round = bumped;
                self.round.fetch_add(1, Ordering::SeqCst);
            }
        }
        Proposal::new(round, self.ctx.id)
    }

    /// Peer handles for a quorum; silently drops members the overlay no
    /// longer knows (they count as unreachable).
    async fn peers_of(&self, quorum: &Quorum) -> Vec<Arc<dyn Peer>> {
        let mut peers = Vec::with_capacity(quorum.len());
        for id in quorum {
            if let Ok(peer) = self.overlay.lookup_node(*id).await {
                peers.push(peer);
            }
        }
        peers
    }

    // =========================================================================
    // STORE
    // =========================================================================

    /// Drive a write. On concurrent mutation the error is
    /// `Conflict { version, current }` for the caller's resolver.
    pub async fn store(&self, block: Block, mode: StoreMode) -> Result<()> {
        let address = block.address();
        if self.ctx.config.validate_signatures {
            block.validate_at(&address)?;
        }
        match address.kind() {
            AddressKind::Immutable => self.store_immutable(block, mode).await,
            AddressKind::Mutable => self.store_mutable(block, mode).await,
        }
    }

    /// Immutable short-circuit: write to every allocated owner.
    async fn store_immutable(&self, block: Block, mode: StoreMode) -> Result<()> {
        let address = block.address();
        let owners = match mode {
            StoreMode::Insert => {
                self.overlay.allocate(address, self.replication_factor()).await?
            }
            StoreMode::Update => {
                self.overlay.lookup(address, self.replication_factor(), false).await?
            }
        };
        if owners.is_empty() {
            return Err(Error::TooFewPeers);
        }
        let mut set = JoinSet::new();
        for owner in owners {
            let block = block.clone();
            set.spawn(async move { owner.store(block, mode).await });
        }
        let mut stored = 0usize;
        let mut first_err = None;
        while let Some(joined) = set.join_next().await {
            match joined.map_err(Error::other)? {
                Ok(()) => stored += 1,
                Err(e) => {
                    // A collision anywhere is authoritative: the address
                    // is taken.
                    if matches!(e, Error::Collision(_)) {
                        return Err(e);
                    }
                    first_err = first_err.or(Some(e));
                }
            }
        }
        if stored == 0 {
            return Err(first_err.unwrap_or(Error::TooFewPeers));
        }
        Ok(())
    }

    async fn store_mutable(&self, block: Block, mode: StoreMode) -> Result<()> {
        let address = block.address();
        let insert = mode == StoreMode::Insert;
        let quorum: Quorum = if insert {
            self.overlay
                .allocate(address, self.replication_factor())
                .await?
                .iter()
                .map(|p| p.id())
                .collect()
        } else {
            match self.current_quorum(address).await? {
                Some(quorum) => quorum,
                None => return Err(Error::MissingBlock(address)),
            }
        };
        self.run_round(address, quorum, Value::Block(block), insert).await?;
        Ok(())
    }

    /// The quorum currently governing an address, from any replica.
    async fn current_quorum(&self, address: Address) -> Result<Option<Quorum>> {
        let peers = self
            .overlay
            .lookup(address, self.replication_factor(), true)
            .await?;
        for peer in peers {
            match peer.get(&Quorum::new(), address, None).await {
                Ok(response) => return Ok(Some(response.quorum)),
                Err(e) => trace!("quorum probe failed at {:?}: {e}", peer.id()),
            }
        }
        Ok(None)
    }

    // =========================================================================
    // THE ROUND
    // =========================================================================

    /// One full propose/accept/confirm cycle, restarting on stale rounds
    /// and quorum changes. Returns the proposal that got confirmed.
    async fn run_round(
        &self,
        address: Address,
        mut quorum: Quorum,
        value: Value,
        insert: bool,
    ) -> Result<Proposal> {
        let mut bump_above: Option<u64> = None;
        for _attempt in 0..MAX_ROUNDS {
            let peers = self.peers_of(&quorum).await;
            let needed = majority(quorum.len());
            if peers.len() < needed {
                return Err(Error::TooFewPeers);
            }
            let proposal = self.next_proposal(bump_above);
            trace!(?address, %proposal, "starting round");

            // -- phase 1: propose -------------------------------------------
            let mut set = JoinSet::new();
            for peer in &peers {
                let peer = peer.clone();
                let quorum = quorum.clone();
                set.spawn(async move {
                    peer.propose(&quorum, address, proposal, insert).await
                });
            }
            let mut promises = Vec::new();
            let mut retry_quorum = None;
            let mut retry_round = None;
            while let Some(joined) = set.join_next().await {
                match joined.map_err(Error::other)? {
                    Ok(response) => promises.push(response),
                    Err(Error::Paxos(PaxosError::WrongQuorum { actual })) => {
                        retry_quorum = Some(actual);
                    }
                    Err(Error::Paxos(PaxosError::Outdated { promised })) => {
                        retry_round = Some(
                            retry_round.map_or(promised.round, |r: u64| r.max(promised.round)),
                        );
                    }
                    Err(Error::Paxos(PaxosError::AlreadyExists)) => {
                        return self.conflict(address).await;
                    }
                    Err(e) => trace!("propose failed: {e}"),
                }
            }
            if let Some(actual) = retry_quorum {
                debug!(?address, "quorum changed underneath us, retrying");
                quorum = actual;
                continue;
            }
            if promises.len() < needed {
                if let Some(round) = retry_round {
                    bump_above = Some(round);
                    round_jitter().await;
                    continue;
                }
                return Err(Error::TooFewPeers);
            }

            // -- safety: adopt the highest previously accepted value --------
            let highest = promises
                .iter()
                .filter_map(|p| p.accepted.clone())
                .max_by_key(|a: &Accepted| a.proposal);
            if let Some(previous) = highest {
                if previous.value != value {
                    // Finish the other proposer's work, then report what
                    // the caller actually lost to.
                    self.complete(address, &quorum, proposal, previous.clone()).await?;
                    match previous.value {
                        Value::Block(current) => {
                            return Err(Error::Conflict {
                                version: current.version(),
                                current: Some(Box::new(current)),
                            })
                        }
                        Value::Quorum(new_quorum) => {
                            // A membership change won; retry the write
                            // against the new quorum.
                            quorum = new_quorum;
                            bump_above = Some(proposal.round);
                            continue;
                        }
                    }
                }
            }

            // -- phase 2: accept --------------------------------------------
            let mut set = JoinSet::new();
            for peer in &peers {
                let peer = peer.clone();
                let quorum = quorum.clone();
                let value = value.clone();
                set.spawn(async move { peer.accept(&quorum, address, proposal, value).await });
            }
            let mut accepts = 0usize;
            let mut version_conflict = None;
            let mut outdated = None;
            while let Some(joined) = set.join_next().await {
                match joined.map_err(Error::other)? {
                    Ok(()) => accepts += 1,
                    Err(Error::Paxos(PaxosError::VersionConflict { version })) => {
                        version_conflict = Some(version);
                    }
                    Err(Error::Paxos(PaxosError::Outdated { promised })) => {
                        outdated = Some(promised.round);
                    }
                    Err(Error::Paxos(PaxosError::WrongQuorum { actual })) => {
                        retry_quorum = Some(actual);
                    }
                    Err(e) => trace!("accept failed: {e}"),
                }
            }
            if let Some(_version) = version_conflict {
                return self.conflict(address).await;
            }
            if let Some(actual) = retry_quorum {
                quorum = actual;
                continue;
            }
            if accepts < needed {
                if let Some(round) = outdated {
                    bump_above = Some(round);
                    round_jitter().await;
                    continue;
                }
                return Err(Error::TooFewPeers);
            }

            // -- phase 3: confirm -------------------------------------------
            self.confirm_round(address, &quorum, &peers, proposal).await?;
            return Ok(proposal);
        }
        Err(Error::TooFewPeers)
    }

    async fn confirm_round(
        &self,
        address: Address,
        quorum: &Quorum,
        peers: &[Arc<dyn Peer>],
        proposal: Proposal,
    ) -> Result<()> {
        let mut set = JoinSet::new();
        for peer in peers {
            let peer = peer.clone();
            let quorum = quorum.clone();
            set.spawn(async move { peer.confirm(&quorum, address, proposal).await });
        }
        let mut confirms = 0usize;
        while let Some(joined) = set.join_next().await {
            if joined.map_err(Error::other)?.is_ok() {
                confirms += 1;
            }
        }
        if confirms < majority(quorum.len()) {
            return Err(Error::TooFewPeers);
        }
        Ok(())
    }

    /// Complete another proposer's accepted value under our proposal
    /// number (Paxos recovery: their value, our round).
    async fn complete(
        &self,
        address: Address,
        quorum: &Quorum,
        proposal: Proposal,
        previous: Accepted,
    ) -> Result<()> {
        debug!(?address, of = %previous.proposal, "completing interrupted round");
        let peers = self.peers_of(quorum).await;
        let needed = majority(quorum.len());
        let mut set = JoinSet::new();
        for peer in &peers {
            let peer = peer.clone();
            let quorum = quorum.clone();
            let value = previous.value.clone();
            set.spawn(async move { peer.accept(&quorum, address, proposal, value).await });
        }
        let mut accepts = 0usize;
        while let Some(joined) = set.join_next().await {
            match joined.map_err(Error::other)? {
                Ok(()) => accepts += 1,
                // Already superseded: someone else is further along.
                Err(Error::Paxos(_)) => {}
                Err(e) => trace!("recovery accept failed: {e}"),
            }
        }
        if accepts >= needed {
            self.confirm_round(address, quorum, &peers, proposal).await?;
        }
        Ok(())
    }

    /// Build the Conflict error from the currently chosen value.
    async fn conflict(&self, address: Address) -> Result<Proposal> {
        let current = self.fetch(address, None).await.ok().flatten();
        let version = current.as_ref().map(|b| b.version()).unwrap_or(0);
        Err(Error::Conflict { version, current: current.map(Box::new) })
    }

    // =========================================================================
    // FETCH
    // =========================================================================

    /// Read an address from its replicas. `Ok(None)` means the caller's
    /// `local_version` is still current.
    pub async fn fetch(
        &self,
        address: Address,
        local_version: Option<u64>,
    ) -> Result<Option<Block>> {
        match address.kind() {
            AddressKind::Immutable => self.fetch_immutable(address).await.map(Some),
            AddressKind::Mutable => self.fetch_mutable(address, local_version).await,
        }
    }

    async fn fetch_immutable(&self, address: Address) -> Result<Block> {
        let peers = self
            .overlay
            .lookup(address, self.replication_factor(), true)
            .await?;
        for peer in peers {
            match peer.fetch(address, None).await {
                Ok(Some(block)) => {
                    if self.ctx.config.validate_signatures {
                        block.validate_at(&address)?;
                    }
                    return Ok(block);
                }
                Ok(None) => continue,
                Err(e) => trace!("fetch miss at {:?}: {e}", peer.id()),
            }
        }
        Err(Error::MissingBlock(address))
    }

    async fn fetch_mutable(
        &self,
        address: Address,
        local_version: Option<u64>,
    ) -> Result<Option<Block>> {
        let peers = self
            .overlay
            .lookup(address, self.replication_factor(), false)
            .await?;
        if peers.is_empty() {
            return Err(Error::MissingBlock(address));
        }

        let mut set = JoinSet::new();
        for peer in &peers {
            let peer = peer.clone();
            set.spawn(async move {
                let response = peer.get(&Quorum::new(), address, local_version).await;
                (peer.id(), response)
            });
        }
        let mut responses = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (id, response) = joined.map_err(Error::other)?;
            match response {
                Ok(response) => responses.push(response),
                Err(e) => trace!("get miss at {id:?}: {e}"),
            }
        }
        if responses.is_empty() {
            return Err(Error::MissingBlock(address));
        }

        // Freshest confirmed value wins.
        let chosen = responses
            .iter()
            .filter_map(|r| r.chosen.clone())
            .max_by_key(|(proposal, _)| *proposal);
        if let Some((_, block)) = chosen {
            if let Some(local) = local_version {
                if block.version() <= local {
                    return Ok(None);
                }
            }
            if self.ctx.config.validate_signatures {
                block.validate_at(&address)?;
            }
            return Ok(Some(block));
        }
        if responses.iter().any(|r| r.not_modified) {
            return Ok(None);
        }

        // No confirmation seen: if a strict majority accepted the same
        // value, finish the interrupted round on the proposer's behalf.
        let quorum = responses[0].quorum.clone();
        let mut counts: HashMap<Proposal, usize> = HashMap::new();
        for response in &responses {
            if let Some(accepted) = &response.accepted {
                if !accepted.confirmed {
                    *counts.entry(accepted.proposal).or_insert(0) += 1;
                }
            }
        }
        let recoverable = counts
            .into_iter()
            .filter(|(_, count)| *count >= majority(quorum.len()))
            .max_by_key(|(proposal, _)| *proposal);
        if let Some((proposal, _)) = recoverable {
            let accepted = responses
                .iter()
                .filter_map(|r| r.accepted.clone())
                .find(|a| a.proposal == proposal)
                .expect("counted proposal present");
            if let Value::Block(block) = &accepted.value {
                info!(?address, "completing unconfirmed value on fetch");
                let peers = self.peers_of(&quorum).await;
                self.confirm_round(address, &quorum, &peers, proposal).await?;
                if self.ctx.config.validate_signatures {
                    block.validate_at(&address)?;
                }
                return Ok(Some(block.clone()));
            }
        }
        Err(Error::MissingBlock(address))
    }

    /// Batched read: one `fetch_multi` RPC per replica instead of one
    /// round trip per address. Results keep request order.
    pub async fn fetch_many(
        &self,
        addresses: &[crate::peer::AddressVersion],
    ) -> Result<Vec<(Address, Result<Block>)>> {
        use std::collections::HashMap as Map;

        // Which peer serves which addresses.
        let mut by_peer: Map<NodeId, (Arc<dyn Peer>, Vec<crate::peer::AddressVersion>)> =
            Map::new();
        for entry in addresses {
            let peers = self
                .overlay
                .lookup(entry.0, self.replication_factor(), true)
                .await?;
            for peer in peers {
                by_peer
                    .entry(peer.id())
                    .or_insert_with(|| (peer.clone(), Vec::new()))
                    .1
                    .push(*entry);
            }
        }

        let mut resolved: Map<Address, Block> = Map::new();
        for (_, (peer, batch)) in by_peer {
            let pending: Vec<crate::peer::AddressVersion> = batch
                .into_iter()
                .filter(|(address, _)| !resolved.contains_key(address))
                .collect();
            if pending.is_empty() {
                continue;
            }
            match peer.fetch_multi(&pending).await {
                Ok(results) => {
                    for (address, result) in results {
                        if let Ok(block) = result {
                            if block.validate_at(&address).is_ok() {
                                resolved.entry(address).or_insert(block);
                            }
                        }
                    }
                }
                Err(e) => trace!("fetch_multi miss at {:?}: {e}", peer.id()),
            }
        }

        Ok(addresses
            .iter()
            .map(|(address, _)| {
                let result = resolved
                    .remove(address)
                    .ok_or(Error::MissingBlock(*address));
                (*address, result)
            })
            .collect())
    }

    // =========================================================================
    // REMOVE
    // =========================================================================

    pub async fn remove(&self, address: Address, signature: RemoveSignature) -> Result<()> {
        let peers = self
            .overlay
            .lookup(address, self.replication_factor(), false)
            .await?;
        if peers.is_empty() {
            return Err(Error::MissingBlock(address));
        }
        let mut set = JoinSet::new();
        for peer in peers {
            let signature = signature.clone();
            set.spawn(async move { peer.remove(address, signature).await });
        }
        let mut removed = 0usize;
        let mut first_err = None;
        while let Some(joined) = set.join_next().await {
            match joined.map_err(Error::other)? {
                Ok(()) => removed += 1,
                Err(e) => first_err = first_err.or(Some(e)),
            }
        }
        if removed == 0 {
            return Err(first_err.unwrap_or(Error::MissingBlock(address)));
        }
        Ok(())
    }

    // =========================================================================
    // REBALANCING
    // =========================================================================

    fn spawn_rebalancer(self: Arc<Self>, mut rx: mpsc::Receiver<Address>) {
        tokio::spawn(async move {
            while let Some(address) = rx.recv().await {
                match self.rebalance(address).await {
                    Ok(true) => {}
                    Ok(false) => trace!(?address, "rebalance not needed"),
                    Err(e) => debug!(?address, "rebalance failed: {e}"),
                }
            }
        });
    }

    /// Startup pass: schedule every locally under-replicated address.
    fn spawn_inspect(self: Arc<Self>) {
        let Some(local) = self.local.clone() else { return };
        tokio::spawn(async move {
            let parts = match local.server().repartition().await {
                Ok(parts) => parts,
                Err(e) => {
                    warn!("inspect scan failed: {e}");
                    return;
                }
            };
            for (address, quorum) in parts {
                if quorum.len() < self.replication_factor() {
                    let _ = self.rebalance_tx.send(address).await;
                }
            }
        });
    }

    /// Watch the overlay: discovery cancels pending evictions, silence
    /// past the node timeout turns into per-block eviction.
    fn spawn_churn_watcher(self: Arc<Self>) {
        let mut events = self.overlay.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(OverlayEvent::Discovered { id, observer }) => {
                        if observer {
                            continue;
                        }
                        if let Some(handle) =
                            self.evictions.lock().expect("evictions poisoned").remove(&id)
                        {
                            debug!(peer = ?id, "peer back, eviction cancelled");
                            handle.abort();
                        }
                    }
                    Ok(OverlayEvent::Disappeared { id, observer }) => {
                        if observer {
                            continue;
                        }
                        let consensus = self.clone();
                        let handle = tokio::spawn(async move {
                            consensus.evict(id).await;
                        });
                        if let Some(previous) = self
                            .evictions
                            .lock()
                            .expect("evictions poisoned")
                            .insert(id, handle)
                        {
                            previous.abort();
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// Schedule rebalancing for every local block that counted on the
    /// lost peer.
    async fn evict(&self, id: NodeId) {
        let Some(local) = &self.local else { return };
        let parts = match local.server().repartition().await {
            Ok(parts) => parts,
            Err(e) => {
                warn!("eviction scan failed: {e}");
                return;
            }
        };
        let mut scheduled = 0usize;
        for (address, quorum) in parts {
            if quorum.contains(&id) {
                let _ = self.rebalance_tx.send(address).await;
                scheduled += 1;
            }
        }
        info!(peer = ?id, scheduled, "evicting silent peer from quorums");
        self.evictions.lock().expect("evictions poisoned").remove(&id);
    }

    /// Bring one address back toward the replication target. Cooperative
    /// and idempotent: concurrent attempts converge on one chosen quorum.
    pub async fn rebalance(&self, address: Address) -> Result<bool> {
        if !self.ctx.config.rebalance_auto_expand {
            return Ok(false);
        }
        let Some(local) = &self.local else { return Ok(false) };
        let current = local.server().quorum_of(address).await?;
        let target = self.replication_factor();

        // Live = still routable through the overlay.
        let mut live = Quorum::new();
        for id in &current {
            if self.overlay.lookup_node(*id).await.is_ok() {
                live.insert(*id);
            }
        }
        if live.len() >= target && live.len() == current.len() {
            return Ok(false);
        }

        let mut new_quorum = live.clone();
        if let Ok(candidates) = self.overlay.allocate(address, target).await {
            for candidate in candidates {
                if new_quorum.len() >= target {
                    break;
                }
                new_quorum.insert(candidate.id());
            }
        }
        if new_quorum == current {
            let _ = self.under_replicated.send((address, live.len()));
            return Ok(false);
        }
        if new_quorum.len() < live.len().max(1) {
            let _ = self.under_replicated.send((address, live.len()));
            return Ok(false);
        }

        info!(?address, from = current.len(), to = new_quorum.len(), "rebalancing");
        let proposal = match self
            .run_round(address, current.clone(), Value::Quorum(new_quorum.clone()), false)
            .await
        {
            Ok(proposal) => proposal,
            // Someone else's round superseded ours; their rebalance (or
            // write) is as good as ours.
            Err(Error::Conflict { .. }) => {
                let _ = self.rebalanced.send(address);
                return Ok(true);
            }
            Err(e) => {
                // The shortfall stands (e.g. no majority of the old
                // quorum left to vote the change through).
                let _ = self.under_replicated.send((address, live.len()));
                return Err(e);
            }
        };

        // New members need the data, not just the membership.
        if let Ok(Some(block)) = local.server().fetch(address, None).await {
            for id in new_quorum.difference(&current) {
                if let Ok(peer) = self.overlay.lookup_node(*id).await {
                    if let Err(e) = peer.propagate(&new_quorum, block.clone(), proposal).await {
                        debug!(peer = ?id, "propagate failed: {e}");
                    }
                }
            }
        }
        if new_quorum.len() < target {
            let _ = self.under_replicated.send((address, new_quorum.len()));
        }
        let _ = self.rebalanced.send(address);
        Ok(true)
    }

    /// Graceful departure: remove ourselves from every quorum we are in,
    /// handing replicas over first.
    pub async fn resign(&self) {
        let Some(local) = self.local.clone() else { return };
        let parts = match local.server().repartition().await {
            Ok(parts) => parts,
            Err(e) => {
                warn!("resign scan failed: {e}");
                return;
            }
        };
        let self_id = self.ctx.id;
        for (address, current) in parts {
            if !current.contains(&self_id) {
                continue;
            }
            let mut new_quorum: Quorum =
                current.iter().copied().filter(|id| *id != self_id).collect();
            if let Ok(candidates) =
                self.overlay.allocate(address, self.replication_factor() + 1).await
            {
                for candidate in candidates {
                    if new_quorum.len() >= self.replication_factor() {
                        break;
                    }
                    if candidate.id() != self_id {
                        new_quorum.insert(candidate.id());
                    }
                }
            }
            if new_quorum.is_empty() {
                warn!(?address, "cannot resign: no other owner available");
                continue;
            }
            let result = self
                .run_round(address, current.clone(), Value::Quorum(new_quorum.clone()), false)
                .await;
            match result {
                Ok(proposal) => {
                    if let Ok(Some(block)) = local.server().fetch(address, None).await {
                        for id in new_quorum.difference(&current) {
                            if let Ok(peer) = self.overlay.lookup_node(*id).await {
                                let _ = peer.propagate(&new_quorum, block.clone(), proposal).await;
                            }
                        }
                    }
                    debug!(?address, "resigned from quorum");
                }
                Err(e) => warn!(?address, "resign round failed: {e}"),
            }
        }
    }

    /// Queue a rebalance (tests and the silo notifier use this).
    pub async fn schedule_rebalance(&self, address: Address) {
        let _ = self.rebalance_tx.send(address).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposal_bumping_clears_stale_rounds() {
        // next_proposal must produce rounds strictly above the hint.
        let round = AtomicU64::new(1);
        let bump = |above: Option<u64>| {
            let mut r = round.fetch_add(1, Ordering::SeqCst);
            if let Some(above) = above {
                while r <= above {
                    let bumped = round.fetch_max(above + 1, Ordering::SeqCst).max(above + 1);
                    r = bumped;
                    round.fetch_add(1, Ordering::SeqCst);
                }
            }
            r
        };
        assert_eq!(bump(None), 1);
        let high = bump(Some(50));
        assert!(high > 50);
        assert!(bump(None) > high);
    }
}
