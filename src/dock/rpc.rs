//! RPC surface: names, request/reply shapes, and the dispatch trait.
//!
//! Blocks cross the wire in their versioned envelope so mixed-version
//! clusters keep talking: each side serializes at the connection's
//! negotiated version and deserializes anything it still supports.
//! Collections ride in bounded containers.

use crate::address::{Address, NodeId};
use crate::blocks::{Block, RemoveSignature, StoreMode};
use crate::consensus::paxos::{
    Accepted, GetResponse, PromiseResponse, Proposal, Quorum, Value,
};
use crate::error::{Error, Result};
use crate::passport::Passport;
use crate::types::Version;
use crate::wire::{BoundedVec, WireError, MAX_FETCH_ADDRESSES, MAX_KEY_IDS, MAX_QUORUM_NODES};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const RPC_STORE: &str = "store";
pub const RPC_FETCH: &str = "fetch";
pub const RPC_FETCH_MULTI: &str = "fetch_multi";
pub const RPC_REMOVE: &str = "remove";
pub const RPC_RESOLVE_KEYS: &str = "resolve_keys";
pub const RPC_RESOLVE_ALL_KEYS: &str = "resolve_all_keys";
pub const RPC_PROPOSE: &str = "propose";
pub const RPC_ACCEPT: &str = "accept";
pub const RPC_CONFIRM: &str = "confirm";
pub const RPC_GET: &str = "get";
pub const RPC_RECONCILE: &str = "reconcile";
pub const RPC_PROPAGATE: &str = "propagate";

/// Authenticated identity of the other end of a connection.
#[derive(Debug, Clone)]
pub struct RemoteInfo {
    pub id: NodeId,
    pub passport: Passport,
    /// Negotiated wire version for this connection.
    pub version: Version,
}

/// Server-side dispatch; one implementation per node, shared by every
/// connection.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, remote: &RemoteInfo, name: &str, body: &[u8]) -> Result<Vec<u8>>;
}

// =============================================================================
// WIRE SHAPES
// =============================================================================

pub type WireQuorum = BoundedVec<NodeId, MAX_QUORUM_NODES>;

pub fn quorum_to_wire(quorum: &Quorum) -> Result<WireQuorum> {
    BoundedVec::new(quorum.iter().copied().collect())
        .ok_or_else(|| Error::other("quorum exceeds the wire bound"))
}

pub fn quorum_from_wire(wire: WireQuorum) -> Quorum {
    wire.into_inner().into_iter().collect()
}

/// A block as envelope bytes at the connection's version.
pub fn block_to_wire(block: &Block, version: Version) -> Result<Vec<u8>> {
    block.to_wire(version).map_err(wire_error)
}

pub fn block_from_wire(bytes: &[u8]) -> Result<Block> {
    Block::from_wire(bytes).map_err(wire_error)
}

fn wire_error(e: WireError) -> Error {
    match e {
        WireError::UnsupportedVersion(v) => {
            Error::ValidationFailed(format!("unsupported wire version {v}"))
        }
        other => Error::Other(other.to_string()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireValue {
    Block(Vec<u8>),
    Quorum(WireQuorum),
}

pub fn value_to_wire(value: &Value, version: Version) -> Result<WireValue> {
    Ok(match value {
        Value::Block(block) => WireValue::Block(block_to_wire(block, version)?),
        Value::Quorum(quorum) => WireValue::Quorum(quorum_to_wire(quorum)?),
    })
}

pub fn value_from_wire(wire: WireValue) -> Result<Value> {
    Ok(match wire {
        WireValue::Block(bytes) => Value::Block(block_from_wire(&bytes)?),
        WireValue::Quorum(quorum) => Value::Quorum(quorum_from_wire(quorum)),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireAccepted {
    pub proposal: Proposal,
    pub value: WireValue,
    pub confirmed: bool,
}

pub fn accepted_to_wire(accepted: &Accepted, version: Version) -> Result<WireAccepted> {
    Ok(WireAccepted {
        proposal: accepted.proposal,
        value: value_to_wire(&accepted.value, version)?,
        confirmed: accepted.confirmed,
    })
}

pub fn accepted_from_wire(wire: WireAccepted) -> Result<Accepted> {
    Ok(Accepted {
        proposal: wire.proposal,
        value: value_from_wire(wire.value)?,
        confirmed: wire.confirmed,
    })
}

// -- requests -----------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRequest {
    pub block: Vec<u8>,
    pub mode: StoreMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub address: Address,
    pub local_version: Option<u64>,
}

/// Fetch reply: the not-modified sentinel saves re-sending a block the
/// caller already holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FetchReply {
    Block(Vec<u8>),
    NotModified,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchMultiRequest {
    pub addresses: BoundedVec<(Address, Option<u64>), MAX_FETCH_ADDRESSES>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchMultiReply {
    pub results: Vec<(Address, std::result::Result<Vec<u8>, Error>)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveRequest {
    pub address: Address,
    pub signature: RemoveSignature,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveKeysRequest {
    pub ids: BoundedVec<u64, MAX_KEY_IDS>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveKeysReply {
    /// Serialized public keys, one per requested id, in request order.
    pub keys: Vec<crate::crypto::PublicKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposeRequest {
    pub quorum: WireQuorum,
    pub address: Address,
    pub proposal: Proposal,
    pub insert: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirePromiseResponse {
    pub accepted: Option<WireAccepted>,
    pub quorum: WireQuorum,
}

pub fn promise_to_wire(resp: &PromiseResponse, version: Version) -> Result<WirePromiseResponse> {
    Ok(WirePromiseResponse {
        accepted: resp
            .accepted
            .as_ref()
            .map(|a| accepted_to_wire(a, version))
            .transpose()?,
        quorum: quorum_to_wire(&resp.quorum)?,
    })
}

pub fn promise_from_wire(wire: WirePromiseResponse) -> Result<PromiseResponse> {
    Ok(PromiseResponse {
        accepted: wire.accepted.map(accepted_from_wire).transpose()?,
        quorum: quorum_from_wire(wire.quorum),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptRequest {
    pub quorum: WireQuorum,
    pub address: Address,
    pub proposal: Proposal,
    pub value: WireValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmRequest {
    pub quorum: WireQuorum,
    pub address: Address,
    pub proposal: Proposal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    pub quorum: WireQuorum,
    pub address: Address,
    pub local_version: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireGetResponse {
    pub accepted: Option<WireAccepted>,
    pub chosen: Option<(Proposal, Vec<u8>)>,
    pub quorum: WireQuorum,
    pub not_modified: bool,
}

pub fn get_response_to_wire(resp: &GetResponse, version: Version) -> Result<WireGetResponse> {
    Ok(WireGetResponse {
        accepted: resp
            .accepted
            .as_ref()
            .map(|a| accepted_to_wire(a, version))
            .transpose()?,
        chosen: resp
            .chosen
            .as_ref()
            .map(|(p, b)| Ok::<_, Error>((*p, block_to_wire(b, version)?)))
            .transpose()?,
        quorum: quorum_to_wire(&resp.quorum)?,
        not_modified: resp.not_modified,
    })
}

pub fn get_response_from_wire(wire: WireGetResponse) -> Result<GetResponse> {
    Ok(GetResponse {
        accepted: wire.accepted.map(accepted_from_wire).transpose()?,
        chosen: wire
            .chosen
            .map(|(p, bytes)| Ok::<_, Error>((p, block_from_wire(&bytes)?)))
            .transpose()?,
        quorum: quorum_from_wire(wire.quorum),
        not_modified: wire.not_modified,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileRequest {
    pub address: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagateRequest {
    pub quorum: WireQuorum,
    pub block: Vec<u8>,
    pub proposal: Proposal,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::MutableBlock;
    use crate::crypto::KeyPair;

    #[test]
    fn value_conversion_roundtrip() {
        let keys = KeyPair::generate();
        let mut block = MutableBlock::new(keys.public().clone());
        block.set_payload(b"payload".to_vec());
        block.seal(&keys).unwrap();
        let value = Value::Block(Block::Mutable(block));

        let wire = value_to_wire(&value, Version::CURRENT).unwrap();
        assert_eq!(value_from_wire(wire).unwrap(), value);

        let quorum: Quorum = (0..3).map(|_| NodeId::random()).collect();
        let value = Value::Quorum(quorum.clone());
        let wire = value_to_wire(&value, Version::CURRENT).unwrap();
        assert_eq!(value_from_wire(wire).unwrap(), Value::Quorum(quorum));
    }

    #[test]
    fn quorum_order_is_canonical() {
        let quorum: Quorum = (0..8).map(|_| NodeId::random()).collect();
        let wire = quorum_to_wire(&quorum).unwrap();
        let mut sorted = wire.clone().into_inner();
        sorted.sort();
        assert_eq!(wire.into_inner(), sorted);
    }
}
