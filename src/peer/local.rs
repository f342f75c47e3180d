//! The local peer: this process's silo and consensus server, plus the
//! dispatcher that exposes them to remote callers over the dock.

use super::{AddressVersion, Peer};
use crate::address::{Address, NodeId};
use crate::blocks::{Block, RemoveSignature, StoreMode};
use crate::consensus::paxos::{GetResponse, PromiseResponse, Proposal, Quorum, Value};
use crate::consensus::server::ConsensusServer;
use crate::context::Context;
use crate::crypto::PublicKey;
use crate::dock::rpc::{self, RemoteInfo, RpcHandler};
use crate::error::{Error, Result};
use crate::wire;
use async_trait::async_trait;
use std::sync::Arc;

pub struct LocalPeer {
    ctx: Arc<Context>,
    server: Arc<ConsensusServer>,
}

impl LocalPeer {
    pub fn new(ctx: Arc<Context>, server: Arc<ConsensusServer>) -> Arc<Self> {
        Arc::new(Self { ctx, server })
    }

    pub fn server(&self) -> &Arc<ConsensusServer> {
        &self.server
    }

    /// The RPC dispatcher serving this peer to the network.
    pub fn dispatcher(self: &Arc<Self>) -> Arc<dyn RpcHandler> {
        Arc::new(Dispatcher { peer: self.clone() })
    }
}

#[async_trait]
impl Peer for LocalPeer {
    fn id(&self) -> NodeId {
        self.ctx.id
    }

    fn connected(&self) -> bool {
        true
    }

    async fn store(&self, block: Block, mode: StoreMode) -> Result<()> {
        self.server.store(block, mode).await
    }

    async fn fetch(
        &self,
        address: Address,
        local_version: Option<u64>,
    ) -> Result<Option<Block>> {
        self.server.fetch(address, local_version).await
    }

    async fn fetch_multi(
        &self,
        addresses: &[AddressVersion],
    ) -> Result<Vec<(Address, Result<Block>)>> {
        let mut out = Vec::with_capacity(addresses.len());
        for (address, local_version) in addresses {
            let result = self.server.fetch(*address, *local_version).await.and_then(|b| {
                b.ok_or(Error::MissingBlock(*address))
            });
            out.push((*address, result));
        }
        Ok(out)
    }

    async fn remove(&self, address: Address, signature: RemoveSignature) -> Result<()> {
        self.server.remove(address, signature).await
    }

    async fn resolve_keys(&self, ids: &[u64]) -> Result<Vec<PublicKey>> {
        ids.iter()
            .map(|id| {
                self.ctx
                    .key_cache
                    .resolve(*id)
                    .ok_or_else(|| Error::other(format!("unknown key id {id:#x}")))
            })
            .collect()
    }

    async fn resolve_all_keys(&self) -> Result<Vec<PublicKey>> {
        Ok(self.ctx.key_cache.all())
    }

    async fn propose(
        &self,
        quorum: &Quorum,
        address: Address,
        proposal: Proposal,
        insert: bool,
    ) -> Result<PromiseResponse> {
        self.server.propose(quorum, address, proposal, insert).await
    }

    async fn accept(
        &self,
        quorum: &Quorum,
        address: Address,
        proposal: Proposal,
        value: Value,
    ) -> Result<()> {
        self.server.accept(quorum, address, proposal, value).await
    }

    async fn confirm(&self, quorum: &Quorum, address: Address, proposal: Proposal) -> Result<()> {
        self.server.confirm(quorum, address, proposal).await
    }

    async fn get(
        &self,
        _quorum: &Quorum,
        address: Address,
        local_version: Option<u64>,
    ) -> Result<GetResponse> {
        self.server.get(address, local_version).await
    }

    async fn reconcile(&self, address: Address) -> Result<bool> {
        self.server.reconcile(address).await
    }

    async fn propagate(&self, quorum: &Quorum, block: Block, proposal: Proposal) -> Result<()> {
        self.server.propagate(quorum, block, proposal).await
    }
}

// =============================================================================
// DISPATCHER
// =============================================================================

struct Dispatcher {
    peer: Arc<LocalPeer>,
}

#[async_trait]
impl RpcHandler for Dispatcher {
    async fn handle(&self, remote: &RemoteInfo, name: &str, body: &[u8]) -> Result<Vec<u8>> {
        let peer = &self.peer;
        let version = remote.version;
        match name {
            rpc::RPC_STORE => {
                let req: rpc::StoreRequest = wire::from_bytes(body)?;
                let block = rpc::block_from_wire(&req.block)?;
                peer.store(block, req.mode).await?;
                Ok(Vec::new())
            }
            rpc::RPC_FETCH => {
                let req: rpc::FetchRequest = wire::from_bytes(body)?;
                let reply = match peer.fetch(req.address, req.local_version).await? {
                    Some(block) => rpc::FetchReply::Block(rpc::block_to_wire(&block, version)?),
                    None => rpc::FetchReply::NotModified,
                };
                Ok(wire::to_bytes(&reply)?)
            }
            rpc::RPC_FETCH_MULTI => {
                let req: rpc::FetchMultiRequest = wire::from_bytes(body)?;
                let results = peer.fetch_multi(&req.addresses).await?;
                let results = results
                    .into_iter()
                    .map(|(address, result)| {
                        let result =
                            result.and_then(|block| rpc::block_to_wire(&block, version));
                        (address, result)
                    })
                    .collect();
                Ok(wire::to_bytes(&rpc::FetchMultiReply { results })?)
            }
            rpc::RPC_REMOVE => {
                let req: rpc::RemoveRequest = wire::from_bytes(body)?;
                peer.remove(req.address, req.signature).await?;
                Ok(Vec::new())
            }
            rpc::RPC_RESOLVE_KEYS => {
                let req: rpc::ResolveKeysRequest = wire::from_bytes(body)?;
                let keys = peer.resolve_keys(&req.ids).await?;
                Ok(wire::to_bytes(&rpc::ResolveKeysReply { keys })?)
            }
            rpc::RPC_RESOLVE_ALL_KEYS => {
                let keys = peer.resolve_all_keys().await?;
                Ok(wire::to_bytes(&rpc::ResolveKeysReply { keys })?)
            }
            rpc::RPC_PROPOSE => {
                let req: rpc::ProposeRequest = wire::from_bytes(body)?;
                let quorum = rpc::quorum_from_wire(req.quorum);
                let response =
                    peer.propose(&quorum, req.address, req.proposal, req.insert).await?;
                Ok(wire::to_bytes(&rpc::promise_to_wire(&response, version)?)?)
            }
            rpc::RPC_ACCEPT => {
                let req: rpc::AcceptRequest = wire::from_bytes(body)?;
                let quorum = rpc::quorum_from_wire(req.quorum);
                let value = rpc::value_from_wire(req.value)?;
                peer.accept(&quorum, req.address, req.proposal, value).await?;
                Ok(Vec::new())
            }
            rpc::RPC_CONFIRM => {
                let req: rpc::ConfirmRequest = wire::from_bytes(body)?;
                let quorum = rpc::quorum_from_wire(req.quorum);
                peer.confirm(&quorum, req.address, req.proposal).await?;
                Ok(Vec::new())
            }
            rpc::RPC_GET => {
                let req: rpc::GetRequest = wire::from_bytes(body)?;
                let quorum = rpc::quorum_from_wire(req.quorum);
                let response = peer.get(&quorum, req.address, req.local_version).await?;
                Ok(wire::to_bytes(&rpc::get_response_to_wire(&response, version)?)?)
            }
            rpc::RPC_RECONCILE => {
                let req: rpc::ReconcileRequest = wire::from_bytes(body)?;
                let changed = peer.reconcile(req.address).await?;
                Ok(wire::to_bytes(&changed)?)
            }
            rpc::RPC_PROPAGATE => {
                let req: rpc::PropagateRequest = wire::from_bytes(body)?;
                let quorum = rpc::quorum_from_wire(req.quorum);
                let block = rpc::block_from_wire(&req.block)?;
                peer.propagate(&quorum, block, req.proposal).await?;
                Ok(Vec::new())
            }
            other => Err(Error::other(format!("unknown rpc {other}"))),
        }
    }
}
