//! Flat-view overlay: every node knows every node.
//!
//! Membership is a single table; placement ranks all storage members by
//! XOR distance to the address, so every node computes the same owners
//! without coordination. The right topology while the cluster fits in
//! one table.

use super::{closest, unknown_node, Overlay, OverlayEvent, PeerSource};
use crate::address::{Address, NodeId};
use crate::context::Context;
use crate::dock::DockEvent;
use crate::error::{Error, Result};
use crate::peer::Peer;
use crate::types::{now, NodeLocation};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct Member {
    observer: bool,
    /// Set while a disappearance countdown is running.
    missing_since: Option<u64>,
}

pub struct FlatOverlay {
    ctx: Arc<Context>,
    source: PeerSource,
    members: Mutex<HashMap<NodeId, Member>>,
    events: broadcast::Sender<OverlayEvent>,
}

impl FlatOverlay {
    pub fn new(ctx: Arc<Context>, source: PeerSource) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let overlay = Arc::new(Self {
            ctx,
            source,
            members: Mutex::new(HashMap::new()),
            events,
        });
        overlay.clone().spawn_watcher();
        overlay
    }

    /// Track dock connectivity: a vanished peer starts the node-timeout
    /// countdown, a reconnect cancels it.
    fn spawn_watcher(self: Arc<Self>) {
        let mut dock_events = self.source.dock().subscribe();
        tokio::spawn(async move {
            loop {
                match dock_events.recv().await {
                    Ok(DockEvent::Connected(id)) => {
                        let known = {
                            let mut members = self.members.lock().expect("members poisoned");
                            match members.get_mut(&id) {
                                Some(member) => {
                                    if member.missing_since.take().is_some() {
                                        debug!(peer = ?id, "peer returned before eviction");
                                    }
                                    true
                                }
                                None => false,
                            }
                        };
                        if !known {
                            // Inbound connection from a peer we had no
                            // hint about: its handshake passport tells us
                            // whether it stores.
                            if let Some(info) = self.source.dock().peer_info(&id) {
                                let observer = !info.passport.capabilities.allow_storage;
                                self.admit(id, observer);
                            }
                        }
                    }
                    Ok(DockEvent::Disconnected(id)) => {
                        let timeout = self.ctx.config.node_timeout;
                        {
                            let mut members = self.members.lock().expect("members poisoned");
                            match members.get_mut(&id) {
                                Some(member) => member.missing_since = Some(now()),
                                None => continue,
                            }
                        }
                        let overlay = self.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(timeout).await;
                            overlay.expire(id);
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// Drop a member whose countdown ran out without a reconnect.
    fn expire(&self, id: NodeId) {
        let expired = {
            let mut members = self.members.lock().expect("members poisoned");
            match members.get(&id) {
                Some(member) if member.missing_since.is_some() => {
                    let observer = member.observer;
                    members.remove(&id);
                    Some(observer)
                }
                _ => None,
            }
        };
        if let Some(observer) = expired {
            info!(peer = ?id, "peer disappeared");
            let _ = self.events.send(OverlayEvent::Disappeared { id, observer });
        }
    }

    fn storage_members(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .members
            .lock()
            .expect("members poisoned")
            .iter()
            .filter(|(_, m)| !m.observer)
            .map(|(id, _)| *id)
            .collect();
        if self.ctx.passport.capabilities.allow_storage {
            ids.push(self.source.local_id());
        }
        ids.sort();
        ids.dedup();
        ids
    }

    fn owners(&self, address: &Address, n: usize) -> Vec<Arc<dyn Peer>> {
        closest(self.storage_members().into_iter(), address, n)
            .into_iter()
            .map(|id| self.source.peer(id))
            .collect()
    }
}

#[async_trait]
impl Overlay for FlatOverlay {
    fn local_id(&self) -> NodeId {
        self.source.local_id()
    }

    async fn allocate(&self, address: Address, n: usize) -> Result<Vec<Arc<dyn Peer>>> {
        let owners = self.owners(&address, n);
        if owners.is_empty() {
            return Err(Error::TooFewPeers);
        }
        Ok(owners)
    }

    async fn lookup(
        &self,
        address: Address,
        n: usize,
        _fast: bool,
    ) -> Result<Vec<Arc<dyn Peer>>> {
        // Same ring slice as allocation: the flat view has no separate
        // index to consult, so "fast" has nothing to shortcut.
        Ok(self.owners(&address, n))
    }

    async fn lookup_node(&self, id: NodeId) -> Result<Arc<dyn Peer>> {
        if id == self.source.local_id()
            || self.members.lock().expect("members poisoned").contains_key(&id)
        {
            return Ok(self.source.peer(id));
        }
        Err(unknown_node(&id))
    }

    async fn discover(&self, locations: Vec<NodeLocation>) {
        for location in locations {
            if location.id.is_null() {
                // Endpoint-only hint: dial to learn the id.
                if let Ok(id) =
                    self.source.dock().connect_endpoints(&location.endpoints).await
                {
                    self.admit(id, false);
                }
                continue;
            }
            if location.id == self.source.local_id() {
                continue;
            }
            self.source.dock().learn_location(location.id, location.endpoints);
            self.admit(location.id, false);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.events.subscribe()
    }

    fn member_count(&self) -> usize {
        self.storage_members().len()
    }
}

impl FlatOverlay {
    fn admit(&self, id: NodeId, observer: bool) {
        let fresh = {
            let mut members = self.members.lock().expect("members poisoned");
            match members.get_mut(&id) {
                Some(member) => {
                    member.missing_since = None;
                    false
                }
                None => {
                    members.insert(id, Member { observer, missing_since: None });
                    true
                }
            }
        };
        if fresh {
            debug!(peer = ?id, observer, "discovered peer");
            let _ = self.events.send(OverlayEvent::Discovered { id, observer });
        }
    }

    /// Register an observer (a client that stores nothing).
    pub fn admit_observer(&self, id: NodeId) {
        self.admit(id, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::consensus::server::ConsensusServer;
    use crate::crypto::KeyPair;
    use crate::passport::{Capabilities, Passport};
    use crate::peer::LocalPeer;
    use crate::silo::MemorySilo;

    fn overlay() -> Arc<FlatOverlay> {
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
            keys,
            owner.public().clone(),
            passport,
            NodeConfig::default(),
        ));
        let dock = crate::dock::Dock::new(ctx.clone());
        let server = ConsensusServer::new(ctx.clone(), Arc::new(MemorySilo::new(None)));
        let local = LocalPeer::new(ctx.clone(), server);
        FlatOverlay::new(ctx, PeerSource::new(dock, local))
    }

    #[tokio::test]
    async fn discovery_emits_events_and_grows_membership() {
        let overlay = overlay();
        let mut events = overlay.subscribe();
        assert_eq!(overlay.member_count(), 1);

        let id = NodeId::random();
        overlay
            .discover(vec![NodeLocation::new(id, vec!["127.0.0.1:9999".parse().unwrap()])])
            .await;
        assert_eq!(overlay.member_count(), 2);
        assert_eq!(
            events.recv().await.unwrap(),
            OverlayEvent::Discovered { id, observer: false }
        );

        // Re-discovery is silent.
        overlay
            .discover(vec![NodeLocation::new(id, vec!["127.0.0.1:9999".parse().unwrap()])])
            .await;
        assert_eq!(overlay.member_count(), 2);
    }

    #[tokio::test]
    async fn allocation_is_stable_for_an_address() {
        let overlay = overlay();
        for _ in 0..5 {
            let id = NodeId::random();
            overlay
                .discover(vec![NodeLocation::new(id, vec!["127.0.0.1:1000".parse().unwrap()])])
                .await;
        }
        let address = Address::random();
        let first: Vec<NodeId> = overlay
            .allocate(address, 3)
            .await
            .unwrap()
            .iter()
            .map(|p| p.id())
            .collect();
        let second: Vec<NodeId> = overlay
            .lookup(address, 3, true)
            .await
            .unwrap()
            .iter()
            .map(|p| p.id())
            .collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[tokio::test]
    async fn observers_do_not_own_blocks() {
        let overlay = overlay();
        let observer = NodeId::random();
        overlay.admit_observer(observer);
        let storage = NodeId::random();
        overlay
            .discover(vec![NodeLocation::new(storage, vec!["127.0.0.1:1000".parse().unwrap()])])
            .await;

        let owners: Vec<NodeId> = overlay
            .allocate(Address::random(), 10)
            .await
            .unwrap()
            .iter()
            .map(|p| p.id())
            .collect();
        assert!(!owners.contains(&observer));
        assert!(owners.contains(&storage));
    }
}
