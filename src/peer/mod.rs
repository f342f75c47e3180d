//! Uniform peer operations.
//!
//! A peer is anywhere a block can live: this process (local silo +
//! consensus server) or a remote node reached through the dock. Both
//! expose the same surface, so the consensus client never cares where a
//! quorum member actually runs.

pub mod local;
pub mod remote;

pub use local::LocalPeer;
pub use remote::RemotePeer;

use crate::address::{Address, NodeId};
use crate::blocks::{Block, RemoveSignature, StoreMode};
use crate::consensus::paxos::{GetResponse, PromiseResponse, Proposal, Quorum, Value};
use crate::crypto::PublicKey;
use crate::error::Result;
use async_trait::async_trait;

/// `(address, caller's local version)` pairs for batched fetches.
pub type AddressVersion = (Address, Option<u64>);

#[async_trait]
pub trait Peer: Send + Sync {
    fn id(&self) -> NodeId;

    /// Whether the peer is currently reachable.
    fn connected(&self) -> bool;

    // -- block operations ----------------------------------------------------

    async fn store(&self, block: Block, mode: StoreMode) -> Result<()>;

    /// Fetch a block; `Ok(None)` is the not-modified sentinel when
    /// `local_version` is already current at the replica.
    async fn fetch(&self, address: Address, local_version: Option<u64>)
        -> Result<Option<Block>>;

    async fn fetch_multi(
        &self,
        addresses: &[AddressVersion],
    ) -> Result<Vec<(Address, Result<Block>)>>;

    async fn remove(&self, address: Address, signature: RemoveSignature) -> Result<()>;

    // -- key cache -----------------------------------------------------------

    async fn resolve_keys(&self, ids: &[u64]) -> Result<Vec<PublicKey>>;

    async fn resolve_all_keys(&self) -> Result<Vec<PublicKey>>;

    // -- paxos ---------------------------------------------------------------

    async fn propose(
        &self,
        quorum: &Quorum,
        address: Address,
        proposal: Proposal,
        insert: bool,
    ) -> Result<PromiseResponse>;

    async fn accept(
        &self,
        quorum: &Quorum,
        address: Address,
        proposal: Proposal,
        value: Value,
    ) -> Result<()>;

    async fn confirm(&self, quorum: &Quorum, address: Address, proposal: Proposal) -> Result<()>;

    async fn get(
        &self,
        quorum: &Quorum,
        address: Address,
        local_version: Option<u64>,
    ) -> Result<GetResponse>;

    /// Bring a returning replica up to date; true when anything changed.
    async fn reconcile(&self, address: Address) -> Result<bool>;

    /// Push a chosen block to a new quorum member.
    async fn propagate(&self, quorum: &Quorum, block: Block, proposal: Proposal) -> Result<()>;
}
