//! Overlay: membership and address→owner routing.
//!
//! Given a mutable address and a replication target, the overlay names
//! the peers that own (or should own) its replicas. Two interchangeable
//! topologies: a flat view for small clusters and group gossip for large
//! ones. Remotes are only ever *used* through the dock, whose handshake
//! verifies their passport against the network owner; the overlay
//! itself just routes hints.

pub mod flat;
pub mod gossip;

pub use flat::FlatOverlay;
pub use gossip::GossipOverlay;

use crate::address::{Address, NodeId};
use crate::dock::Dock;
use crate::error::{Error, Result};
use crate::peer::{LocalPeer, Peer, RemotePeer};
use crate::types::NodeLocation;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayEvent {
    /// A peer became known. Observers consume the network without
    /// contributing storage.
    Discovered { id: NodeId, observer: bool },
    /// A peer has been silent past the node timeout.
    Disappeared { id: NodeId, observer: bool },
}

#[async_trait]
pub trait Overlay: Send + Sync {
    fn local_id(&self) -> NodeId;

    /// Peers chosen to own new replicas of a block being written.
    async fn allocate(&self, address: Address, n: usize) -> Result<Vec<Arc<dyn Peer>>>;

    /// Peers believed to own existing replicas. `fast` returns partial
    /// results as soon as any are known.
    async fn lookup(&self, address: Address, n: usize, fast: bool)
        -> Result<Vec<Arc<dyn Peer>>>;

    async fn lookup_node(&self, id: NodeId) -> Result<Arc<dyn Peer>>;

    /// Hint peers and their endpoints (bootstrap, rendezvous, gossip).
    async fn discover(&self, locations: Vec<NodeLocation>);

    fn subscribe(&self) -> broadcast::Receiver<OverlayEvent>;

    /// Storage-contributing peers currently visible (self included).
    fn member_count(&self) -> usize;
}

/// Materializes peer handles: the local peer for our own id, dock-backed
/// remotes for everyone else.
#[derive(Clone)]
pub struct PeerSource {
    dock: Arc<Dock>,
    local: Arc<LocalPeer>,
}

impl PeerSource {
    pub fn new(dock: Arc<Dock>, local: Arc<LocalPeer>) -> Self {
        Self { dock, local }
    }

    pub fn local_id(&self) -> NodeId {
        self.local.id()
    }

    pub fn peer(&self, id: NodeId) -> Arc<dyn Peer> {
        if id == self.local.id() {
            self.local.clone()
        } else {
            RemotePeer::new(self.dock.clone(), id)
        }
    }

    pub fn dock(&self) -> &Arc<Dock> {
        &self.dock
    }
}

/// XOR distance between a node id and an address, compared
/// lexicographically. Deterministic placement: every node ranks
/// candidates identically.
pub(crate) fn xor_distance(id: &NodeId, address: &Address) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = id.0[i] ^ address.0[i];
    }
    out
}

/// Shared helper: rank storage members by XOR distance to an address and
/// keep the closest n.
pub(crate) fn closest(
    members: impl Iterator<Item = NodeId>,
    address: &Address,
    n: usize,
) -> Vec<NodeId> {
    let mut ranked: Vec<(NodeId, [u8; 32])> = members
        .map(|id| {
            let d = xor_distance(&id, address);
            (id, d)
        })
        .collect();
    ranked.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
    ranked.into_iter().take(n).map(|(id, _)| id).collect()
}

pub(crate) fn unknown_node(id: &NodeId) -> Error {
    Error::other(format!("unknown node {id:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closest_is_deterministic_and_bounded() {
        let address = Address::random();
        let members: Vec<NodeId> = (0..10).map(|_| NodeId::random()).collect();
        let a = closest(members.iter().copied(), &address, 3);
        let b = closest(members.iter().rev().copied(), &address, 3);
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        let all = closest(members.iter().copied(), &address, 100);
        assert_eq!(all.len(), 10);
    }
}
