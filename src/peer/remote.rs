//! The remote peer: dock RPCs behind the uniform peer surface.
//!
//! Transport faults retry transparently under the bounded jittered
//! backoff, redialing through the dock (which refreshes endpoints from
//! the overlay's hints). Everything else escalates unchanged.

use super::{AddressVersion, Peer};
use crate::address::{Address, NodeId};
use crate::blocks::{Block, RemoveSignature, StoreMode};
use crate::consensus::paxos::{GetResponse, PromiseResponse, Proposal, Quorum, Value};
use crate::crypto::PublicKey;
use crate::dock::rpc;
use crate::dock::{Connection, Dock};
use crate::error::{Error, Result};
use crate::types::Backoff;
use crate::wire::{self, BoundedVec};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

pub struct RemotePeer {
    id: NodeId,
    dock: Arc<Dock>,
}

impl RemotePeer {
    pub fn new(dock: Arc<Dock>, id: NodeId) -> Arc<Self> {
        Arc::new(Self { id, dock })
    }

    async fn connection(&self) -> Result<Arc<Connection>> {
        self.dock.connection(self.id).await
    }

    /// One RPC with transparent retry on transport faults.
    async fn call<Req, Resp>(&self, name: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let mut backoff = Backoff::new();
        loop {
            let result = match self.connection().await {
                Ok(connection) => connection.call(name, request).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        debug!(peer = ?self.id, rpc = name, attempt = backoff.attempts(),
                               "transport fault, retrying: {e}");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    async fn wire_version(&self) -> Result<crate::types::Version> {
        Ok(self.connection().await?.info().version)
    }
}

#[async_trait]
impl Peer for RemotePeer {
    fn id(&self) -> NodeId {
        self.id
    }

    fn connected(&self) -> bool {
        self.dock.is_connected(&self.id)
    }

    async fn store(&self, block: Block, mode: StoreMode) -> Result<()> {
        let version = self.wire_version().await?;
        let request = rpc::StoreRequest { block: rpc::block_to_wire(&block, version)?, mode };
        self.call::<_, ()>(rpc::RPC_STORE, &request).await
    }

    async fn fetch(
        &self,
        address: Address,
        local_version: Option<u64>,
    ) -> Result<Option<Block>> {
        let request = rpc::FetchRequest { address, local_version };
        let reply: rpc::FetchReply = self.call(rpc::RPC_FETCH, &request).await?;
        match reply {
            rpc::FetchReply::Block(bytes) => Ok(Some(rpc::block_from_wire(&bytes)?)),
            rpc::FetchReply::NotModified => Ok(None),
        }
    }

    async fn fetch_multi(
        &self,
        addresses: &[AddressVersion],
    ) -> Result<Vec<(Address, Result<Block>)>> {
        let request = rpc::FetchMultiRequest {
            addresses: BoundedVec::new(addresses.to_vec())
                .ok_or_else(|| Error::other("fetch_multi batch too large"))?,
        };
        let reply: rpc::FetchMultiReply = self.call(rpc::RPC_FETCH_MULTI, &request).await?;
        Ok(reply
            .results
            .into_iter()
            .map(|(address, result)| {
                (address, result.and_then(|bytes| rpc::block_from_wire(&bytes)))
            })
            .collect())
    }

    async fn remove(&self, address: Address, signature: RemoveSignature) -> Result<()> {
        let request = rpc::RemoveRequest { address, signature };
        self.call::<_, ()>(rpc::RPC_REMOVE, &request).await
    }

    /// Fetch only the ids missing from the process key cache and feed the
    /// answers back into it.
    async fn resolve_keys(&self, ids: &[u64]) -> Result<Vec<PublicKey>> {
        let cache = &self.dock.context().key_cache;
        let missing = cache.missing(ids);
        if !missing.is_empty() {
            let request = rpc::ResolveKeysRequest {
                ids: BoundedVec::new(missing.clone())
                    .ok_or_else(|| Error::other("resolve_keys batch too large"))?,
            };
            let reply: rpc::ResolveKeysReply = self.call(rpc::RPC_RESOLVE_KEYS, &request).await?;
            if reply.keys.len() != missing.len() {
                return Err(Error::other(format!(
                    "resolve_keys for {} ids gave {} replies",
                    missing.len(),
                    reply.keys.len()
                )));
            }
            for key in &reply.keys {
                cache.ensure(key);
            }
        }
        ids.iter()
            .map(|id| {
                cache
                    .resolve(*id)
                    .ok_or_else(|| Error::other(format!("key id {id:#x} still unresolved")))
            })
            .collect()
    }

    /// Pre-seed the cache right after connecting.
    async fn resolve_all_keys(&self) -> Result<Vec<PublicKey>> {
        let reply: rpc::ResolveKeysReply =
            self.call(rpc::RPC_RESOLVE_ALL_KEYS, &()).await?;
        let cache = &self.dock.context().key_cache;
        for key in &reply.keys {
            cache.ensure(key);
        }
        Ok(reply.keys)
    }

    async fn propose(
        &self,
        quorum: &Quorum,
        address: Address,
        proposal: Proposal,
        insert: bool,
    ) -> Result<PromiseResponse> {
        let request = rpc::ProposeRequest {
            quorum: rpc::quorum_to_wire(quorum)?,
            address,
            proposal,
            insert,
        };
        let reply: rpc::WirePromiseResponse = self.call(rpc::RPC_PROPOSE, &request).await?;
        rpc::promise_from_wire(reply)
    }

    async fn accept(
        &self,
        quorum: &Quorum,
        address: Address,
        proposal: Proposal,
        value: Value,
    ) -> Result<()> {
        let version = self.wire_version().await?;
        let request = rpc::AcceptRequest {
            quorum: rpc::quorum_to_wire(quorum)?,
            address,
            proposal,
            value: rpc::value_to_wire(&value, version)?,
        };
        self.call::<_, ()>(rpc::RPC_ACCEPT, &request).await
    }

    async fn confirm(&self, quorum: &Quorum, address: Address, proposal: Proposal) -> Result<()> {
        let request = rpc::ConfirmRequest {
            quorum: rpc::quorum_to_wire(quorum)?,
            address,
            proposal,
        };
        self.call::<_, ()>(rpc::RPC_CONFIRM, &request).await
    }

    async fn get(
        &self,
        quorum: &Quorum,
        address: Address,
        local_version: Option<u64>,
    ) -> Result<GetResponse> {
        let request = rpc::GetRequest {
            quorum: rpc::quorum_to_wire(quorum)?,
            address,
            local_version,
        };
        let reply: rpc::WireGetResponse = self.call(rpc::RPC_GET, &request).await?;
        rpc::get_response_from_wire(reply)
    }

    async fn reconcile(&self, address: Address) -> Result<bool> {
        let request = rpc::ReconcileRequest { address };
        self.call(rpc::RPC_RECONCILE, &request).await
    }

    async fn propagate(&self, quorum: &Quorum, block: Block, proposal: Proposal) -> Result<()> {
        let version = self.wire_version().await?;
        let request = rpc::PropagateRequest {
            quorum: rpc::quorum_to_wire(quorum)?,
            block: rpc::block_to_wire(&block, version)?,
            proposal,
        };
        self.call::<_, ()>(rpc::RPC_PROPAGATE, &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;

    #[test]
    fn unit_reply_decodes() {
        // Empty RPC replies decode as unit through postcard.
        let bytes = wire::to_bytes(&()).unwrap();
        let _: () = wire::from_bytes(&bytes).unwrap();
        let _: () = wire::from_bytes(&[]).unwrap();
    }
}
