//! Group-gossip overlay.
//!
//! Nodes hash into `k` groups. Each node keeps every contact of its own
//! group plus a bounded sample of other groups, and indexes the files of
//! its group. State spreads by periodic gossip over UDP; cross-group
//! queries hop through contacts of the target group with a TTL and route
//! replies back hop by hop.
//!
//! The gossip plane runs on the dock port + 1. Packets are optionally
//! sealed under a key derived from the network owner key; plaintext is
//! accepted only while `accept_plain` holds.

use super::{closest, unknown_node, Overlay, OverlayEvent, PeerSource};
use crate::address::{Address, NodeId};
use crate::config::GossipConfig;
use crate::context::Context;
use crate::crypto::{sha3_parts, SymmetricKey};
use crate::error::{Error, Result};
use crate::peer::Peer;
use crate::types::{now, Endpoint, Endpoints, NodeLocation};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, trace, warn};

/// Gossip datagram budget; stays under common MTUs.
const MAX_PACKET: usize = 1400;

/// Offset from the dock port to the gossip UDP port.
pub const GOSSIP_PORT_OFFSET: u16 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContactCard {
    id: NodeId,
    endpoints: Endpoints,
    observer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Packet {
    Ping(ContactCard),
    Pong(ContactCard),
    Gossip {
        from: ContactCard,
        contacts: Vec<ContactCard>,
        /// `(address, owner)` pairs for the receiver's group.
        files: Vec<(Address, NodeId)>,
    },
    GetFile { id: u64, address: Address, n: u8, ttl: u8 },
    GotFile { id: u64, owners: Vec<ContactCard> },
    PutFile { id: u64, address: Address, n: u8, ttl: u8 },
    GotCandidates { id: u64, candidates: Vec<ContactCard> },
}

#[derive(Debug, Clone)]
struct Contact {
    endpoints: Endpoints,
    observer: bool,
    last_seen: u64,
    gossip_count: u32,
}

impl Contact {
    fn gossip_addr(&self) -> Option<SocketAddr> {
        self.endpoints.first().map(|e| {
            SocketAddr::new(e.ip, e.port.wrapping_add(GOSSIP_PORT_OFFSET))
        })
    }
}

#[derive(Debug, Default)]
struct FileEntry {
    /// Owner id → last refresh time.
    owners: HashMap<NodeId, u64>,
    gossip_count: u32,
}

#[derive(Default)]
struct State {
    contacts: HashMap<NodeId, Contact>,
    files: HashMap<Address, FileEntry>,
    /// Addresses stored by this node, re-announced while present.
    local_files: std::collections::HashSet<Address>,
    /// Query id → where the query came from (hop-by-hop reply routing).
    routes: HashMap<u64, (SocketAddr, u64)>,
}

pub struct GossipOverlay {
    ctx: Arc<Context>,
    source: PeerSource,
    config: GossipConfig,
    state: Mutex<State>,
    socket: OnceLock<Arc<UdpSocket>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Vec<ContactCard>>>>,
    next_query: AtomicU64,
    events: broadcast::Sender<OverlayEvent>,
    /// Symmetric key for sealed gossip, derived from the owner key.
    network_key: SymmetricKey,
}

impl GossipOverlay {
    pub fn new(ctx: Arc<Context>, source: PeerSource, config: GossipConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let network_key = SymmetricKey::from_bytes(&sha3_parts(&[
            &ctx.owner.digest(),
            b"burrow-gossip",
        ]))
        .expect("digest is key sized");
        let overlay = Arc::new(Self {
            ctx,
            source,
            config,
            state: Mutex::new(State::default()),
            socket: OnceLock::new(),
            pending: Mutex::new(HashMap::new()),
            next_query: AtomicU64::new(1),
            events,
            network_key,
        });
        overlay.clone().spawn_loop();
        overlay
    }

    fn group_of_bytes(&self, bytes: &[u8; 32]) -> usize {
        let k = self.config.k.max(1);
        let n = u64::from_le_bytes(bytes[..8].try_into().expect("8 bytes"));
        (n % k as u64) as usize
    }

    fn group_of_node(&self, id: &NodeId) -> usize {
        self.group_of_bytes(&crate::crypto::sha3(&id.0))
    }

    fn group_of_address(&self, address: &Address) -> usize {
        self.group_of_bytes(&crate::crypto::sha3(&address.0))
    }

    fn our_group(&self) -> usize {
        self.group_of_node(&self.source.local_id())
    }

    /// The dock port we advertise; the bound address wins over the
    /// configured one (port 0 means "pick one").
    fn dock_port(&self) -> u16 {
        self.source
            .dock()
            .listen_addr()
            .map(|a| a.port())
            .unwrap_or(self.ctx.config.port)
    }

    fn own_card(&self) -> ContactCard {
        ContactCard {
            id: self.source.local_id(),
            endpoints: vec![Endpoint::new(self.ctx.config.listen_address, self.dock_port())],
            observer: !self.ctx.passport.capabilities.allow_storage,
        }
    }

    // =========================================================================
    // PACKET I/O
    // =========================================================================

    fn encode(&self, packet: &Packet) -> Option<Vec<u8>> {
        let body = postcard::to_allocvec(packet).ok()?;
        let mut out = Vec::with_capacity(body.len() + 17);
        if self.config.encrypt {
            out.push(1);
            out.extend_from_slice(&self.network_key.encrypt(&body).ok()?);
        } else {
            out.push(0);
            out.extend_from_slice(&body);
        }
        if out.len() > MAX_PACKET {
            warn!("gossip packet over budget ({} bytes), dropped", out.len());
            return None;
        }
        Some(out)
    }

    fn decode(&self, data: &[u8]) -> Option<Packet> {
        let (&kind, body) = data.split_first()?;
        match kind {
            0 if self.config.accept_plain => postcard::from_bytes(body).ok(),
            0 => {
                trace!("plaintext gossip refused");
                None
            }
            1 => {
                let plain = self.network_key.decrypt(body).ok()?;
                postcard::from_bytes(&plain).ok()
            }
            _ => None,
        }
    }

    async fn send_to(&self, target: SocketAddr, packet: &Packet) {
        let Some(socket) = self.socket.get() else { return };
        if let Some(bytes) = self.encode(packet) {
            let _ = socket.send_to(&bytes, target).await;
        }
    }

    async fn send_to_contact(&self, id: &NodeId, packet: &Packet) {
        let addr = {
            let state = self.state.lock().expect("gossip state poisoned");
            state.contacts.get(id).and_then(|c| c.gossip_addr())
        };
        if let Some(addr) = addr {
            self.send_to(addr, packet).await;
        }
    }

    // =========================================================================
    // MAIN LOOP
    // =========================================================================

    fn spawn_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let port = self.dock_port().wrapping_add(GOSSIP_PORT_OFFSET);
            let bind = SocketAddr::new(self.ctx.config.listen_address, port);
            let socket = match UdpSocket::bind(bind).await {
                Ok(s) => Arc::new(s),
                Err(e) => {
                    warn!(%bind, "gossip socket bind failed: {e}");
                    return;
                }
            };
            info!(addr = %bind, group = self.our_group(), "gossip overlay running");
            let _ = self.socket.set(socket.clone());

            let mut ticker =
                tokio::time::interval(Duration::from_secs(self.config.gossip_interval_secs.max(1)));
            let mut buf = vec![0u8; MAX_PACKET];
            loop {
                tokio::select! {
                    recv = socket.recv_from(&mut buf) => {
                        let Ok((n, from)) = recv else { return };
                        if let Some(packet) = self.decode(&buf[..n]) {
                            self.handle(packet, from).await;
                        }
                    }
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                }
            }
        });
    }

    async fn handle(&self, packet: Packet, from: SocketAddr) {
        match packet {
            Packet::Ping(card) => {
                self.admit(card);
                self.send_to(from, &Packet::Pong(self.own_card())).await;
            }
            Packet::Pong(card) => self.admit(card),
            Packet::Gossip { from: sender, contacts, files } => {
                self.admit(sender);
                for card in contacts {
                    self.admit(card);
                }
                let our_group = self.our_group();
                let mut state = self.state.lock().expect("gossip state poisoned");
                for (address, owner) in files {
                    if self.group_of_address(&address) != our_group {
                        continue;
                    }
                    let entry = state.files.entry(address).or_default();
                    entry.owners.insert(owner, now());
                }
            }
            Packet::GetFile { id, address, n, ttl } => {
                self.answer_query(id, address, n, ttl, from, false).await;
            }
            Packet::PutFile { id, address, n, ttl } => {
                self.answer_query(id, address, n, ttl, from, true).await;
            }
            Packet::GotFile { id, owners } | Packet::GotCandidates { id, candidates: owners } => {
                for card in &owners {
                    self.admit(card.clone());
                }
                // Either our own query, or one we forwarded.
                let waiter = self.pending.lock().expect("pending poisoned").remove(&id);
                if let Some(tx) = waiter {
                    let _ = tx.send(owners);
                    return;
                }
                let route = {
                    let mut state = self.state.lock().expect("gossip state poisoned");
                    state.routes.remove(&id)
                };
                if let Some((back, _)) = route {
                    self.send_to(back, &Packet::GotFile { id, owners }).await;
                }
            }
        }
    }

    /// Serve or forward a file query.
    async fn answer_query(
        &self,
        id: u64,
        address: Address,
        n: u8,
        ttl: u8,
        from: SocketAddr,
        put: bool,
    ) {
        let our_group = self.our_group();
        if self.group_of_address(&address) == our_group {
            let cards = if put {
                self.placement_cards(&address, n as usize)
            } else {
                self.owner_cards(&address, n as usize)
            };
            let reply = if put {
                Packet::GotCandidates { id, candidates: cards }
            } else {
                Packet::GotFile { id, owners: cards }
            };
            self.send_to(from, &reply).await;
            return;
        }
        if ttl == 0 {
            return;
        }
        // Forward toward the target group, remembering the way back.
        let next = self.contacts_of_group(self.group_of_address(&address), 1);
        if let Some(next_id) = next.first() {
            {
                let mut state = self.state.lock().expect("gossip state poisoned");
                state.routes.insert(id, (from, now()));
            }
            let packet = if put {
                Packet::PutFile { id, address, n, ttl: ttl - 1 }
            } else {
                Packet::GetFile { id, address, n, ttl: ttl - 1 }
            };
            self.send_to_contact(next_id, &packet).await;
        }
    }

    /// Known owners of an address in our group, as cards.
    fn owner_cards(&self, address: &Address, n: usize) -> Vec<ContactCard> {
        let state = self.state.lock().expect("gossip state poisoned");
        let Some(entry) = state.files.get(address) else { return Vec::new() };
        let mut cards = Vec::new();
        for owner in entry.owners.keys() {
            if *owner == self.source.local_id() {
                cards.push(self.own_card());
            } else if let Some(contact) = state.contacts.get(owner) {
                cards.push(ContactCard {
                    id: *owner,
                    endpoints: contact.endpoints.clone(),
                    observer: contact.observer,
                });
            }
            if cards.len() >= n {
                break;
            }
        }
        cards
    }

    /// Placement candidates for a new block of our group.
    fn placement_cards(&self, address: &Address, n: usize) -> Vec<ContactCard> {
        let our_group = self.our_group();
        let state = self.state.lock().expect("gossip state poisoned");
        let mut members: Vec<NodeId> = state
            .contacts
            .iter()
            .filter(|(id, c)| !c.observer && self.group_of_node(id) == our_group)
            .map(|(id, _)| *id)
            .collect();
        if self.ctx.passport.capabilities.allow_storage {
            members.push(self.source.local_id());
        }
        closest(members.into_iter(), address, n)
            .into_iter()
            .map(|id| {
                if id == self.source.local_id() {
                    self.own_card()
                } else {
                    let contact = &state.contacts[&id];
                    ContactCard {
                        id,
                        endpoints: contact.endpoints.clone(),
                        observer: contact.observer,
                    }
                }
            })
            .collect()
    }

    fn contacts_of_group(&self, group: usize, n: usize) -> Vec<NodeId> {
        let state = self.state.lock().expect("gossip state poisoned");
        let mut ids: Vec<NodeId> = state
            .contacts
            .iter()
            .filter(|(id, c)| !c.observer && self.group_of_node(id) == group)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids.truncate(n.max(1));
        ids
    }

    // =========================================================================
    // GOSSIP TICK
    // =========================================================================

    async fn tick(&self) {
        self.expire();
        let our_group = self.our_group();
        let time = now();
        let (group_targets, other_targets, ping_targets, contact_sample, file_sample) = {
            let mut state = self.state.lock().expect("gossip state poisoned");
            let mut rng = rand::thread_rng();

            let mut group: Vec<NodeId> = Vec::new();
            let mut other: Vec<NodeId> = Vec::new();
            let mut ping_targets: Vec<NodeId> = Vec::new();
            for (id, contact) in state.contacts.iter() {
                if contact.last_seen + self.config.ping_interval_secs <= time {
                    ping_targets.push(*id);
                }
                if contact.observer {
                    continue;
                }
                if self.group_of_node(id) == our_group {
                    group.push(*id);
                } else {
                    other.push(*id);
                }
            }
            group.shuffle(&mut rng);
            other.shuffle(&mut rng);
            group.truncate(self.config.fanout.contacts_group.max(1));
            other.truncate(self.config.fanout.contacts_other);

            // Spread "new" entries first (gossiped fewer than
            // new_threshold times); old well-known entries only fill
            // leftover fanout.
            let mut contact_ids: Vec<NodeId> = state
                .contacts
                .iter()
                .filter(|(_, c)| {
                    (c.gossip_count as usize) < self.config.new_threshold
                        || c.last_seen + self.config.old_threshold_secs > time
                })
                .map(|(id, _)| *id)
                .collect();
            contact_ids.sort_by_key(|id| state.contacts[id].gossip_count);
            contact_ids.truncate(self.config.fanout.contacts_group + self.config.fanout.contacts_other);
            let contact_sample: Vec<ContactCard> = contact_ids
                .iter()
                .map(|id| {
                    let c = state.contacts.get_mut(id).expect("sampled contact");
                    c.gossip_count += 1;
                    ContactCard { id: *id, endpoints: c.endpoints.clone(), observer: c.observer }
                })
                .collect();

            let local_id = self.source.local_id();
            let local_files: Vec<Address> = state.local_files.iter().copied().collect();
            for address in &local_files {
                let entry = state.files.entry(*address).or_default();
                entry.owners.insert(local_id, now());
            }
            let mut file_addresses: Vec<Address> = state.files.keys().copied().collect();
            file_addresses.sort_by_key(|a| state.files[a].gossip_count);
            file_addresses.truncate(self.config.fanout.files);
            let mut file_sample: Vec<(Address, NodeId)> = Vec::new();
            for address in file_addresses {
                let entry = state.files.get_mut(&address).expect("sampled file");
                entry.gossip_count += 1;
                for owner in entry.owners.keys() {
                    file_sample.push((address, *owner));
                }
            }
            (group, other, ping_targets, contact_sample, file_sample)
        };

        let own = self.own_card();
        for id in ping_targets {
            self.send_to_contact(&id, &Packet::Ping(own.clone())).await;
        }
        for id in group_targets {
            let packet = Packet::Gossip {
                from: own.clone(),
                contacts: contact_sample.clone(),
                files: file_sample.clone(),
            };
            self.send_to_contact(&id, &packet).await;
        }
        for id in other_targets {
            // Cross-group gossip spreads contacts only; files stay in
            // their group.
            let packet = Packet::Gossip {
                from: own.clone(),
                contacts: contact_sample.clone(),
                files: Vec::new(),
            };
            self.send_to_contact(&id, &packet).await;
        }
    }

    fn expire(&self) {
        let contact_timeout = self.config.contact_timeout_secs;
        let file_timeout = self.config.file_timeout_secs;
        let time = now();
        let mut gone = Vec::new();
        {
            let mut state = self.state.lock().expect("gossip state poisoned");
            state.contacts.retain(|id, contact| {
                let live = contact.last_seen + contact_timeout > time;
                if !live {
                    gone.push((*id, contact.observer));
                }
                live
            });
            for entry in state.files.values_mut() {
                entry.owners.retain(|_, seen| *seen + file_timeout > time);
            }
            state.files.retain(|_, entry| !entry.owners.is_empty());
            state.routes.retain(|_, (_, at)| *at + 60 > time);
        }
        for (id, observer) in gone {
            debug!(peer = ?id, "contact timed out");
            let _ = self.events.send(OverlayEvent::Disappeared { id, observer });
        }
    }

    fn admit(&self, card: ContactCard) {
        if card.id == self.source.local_id() || card.endpoints.is_empty() {
            return;
        }
        let our_group = self.our_group();
        let fresh = {
            let mut state = self.state.lock().expect("gossip state poisoned");
            match state.contacts.get_mut(&card.id) {
                Some(contact) => {
                    contact.last_seen = now();
                    contact.endpoints = card.endpoints.clone();
                    false
                }
                None => {
                    // Foreign-group contacts are a bounded sample.
                    if self.group_of_node(&card.id) != our_group {
                        let foreign = state
                            .contacts
                            .iter()
                            .filter(|(id, _)| self.group_of_node(id) != our_group)
                            .count();
                        if foreign >= self.config.max_other_contacts {
                            return;
                        }
                    }
                    state.contacts.insert(
                        card.id,
                        Contact {
                            endpoints: card.endpoints.clone(),
                            observer: card.observer,
                            last_seen: now(),
                            gossip_count: 0,
                        },
                    );
                    true
                }
            }
        };
        self.source.dock().learn_location(card.id, card.endpoints.clone());
        if fresh {
            debug!(peer = ?card.id, observer = card.observer, "gossip discovered peer");
            let _ = self
                .events
                .send(OverlayEvent::Discovered { id: card.id, observer: card.observer });
        }
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    async fn query(
        &self,
        address: Address,
        n: usize,
        fast: bool,
        put: bool,
    ) -> Vec<ContactCard> {
        let group = self.group_of_address(&address);
        let retries = if put { self.config.query_put_retries } else { self.config.query_get_retries };
        let ttl = if put { self.config.query_put_ttl } else { self.config.query_get_ttl };
        let mut collected: Vec<ContactCard> = Vec::new();

        for _ in 0..retries.max(1) {
            let targets = self.contacts_of_group(group, 3);
            if targets.is_empty() {
                break;
            }
            let id = self.next_query.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = oneshot::channel();
            self.pending.lock().expect("pending poisoned").insert(id, tx);
            for target in &targets {
                let packet = if put {
                    Packet::PutFile { id, address, n: n as u8, ttl: ttl as u8 }
                } else {
                    Packet::GetFile { id, address, n: n as u8, ttl: ttl as u8 }
                };
                self.send_to_contact(target, &packet).await;
            }
            let timeout = Duration::from_secs(self.config.query_timeout_secs.max(1));
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(cards)) => {
                    for card in cards {
                        if !collected.iter().any(|c| c.id == card.id) {
                            collected.push(card);
                        }
                    }
                    if fast && !collected.is_empty() {
                        break;
                    }
                    if collected.len() >= n {
                        break;
                    }
                }
                _ => {
                    self.pending.lock().expect("pending poisoned").remove(&id);
                }
            }
        }
        collected.truncate(n);
        collected
    }

    fn cards_to_peers(&self, cards: Vec<ContactCard>) -> Vec<Arc<dyn Peer>> {
        cards
            .into_iter()
            .filter(|c| !c.observer)
            .map(|card| {
                self.source.dock().learn_location(card.id, card.endpoints.clone());
                self.source.peer(card.id)
            })
            .collect()
    }

    /// Announce a locally stored address to its group.
    pub fn publish(&self, address: Address) {
        let mut state = self.state.lock().expect("gossip state poisoned");
        state.local_files.insert(address);
        let local_id = self.source.local_id();
        if self.group_of_address(&address) == self.our_group() {
            state.files.entry(address).or_default().owners.insert(local_id, now());
        }
    }

    pub fn unpublish(&self, address: &Address) {
        let mut state = self.state.lock().expect("gossip state poisoned");
        state.local_files.remove(address);
        let local_id = self.source.local_id();
        if let Some(entry) = state.files.get_mut(address) {
            entry.owners.remove(&local_id);
        }
    }

    /// Block until `wait_nodes` storage contacts are visible.
    pub async fn wait_ready(&self) {
        let needed = self.config.wait_nodes;
        while self.member_count() < needed {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
}

#[async_trait]
impl Overlay for GossipOverlay {
    fn local_id(&self) -> NodeId {
        self.source.local_id()
    }

    async fn allocate(&self, address: Address, n: usize) -> Result<Vec<Arc<dyn Peer>>> {
        let cards = if self.group_of_address(&address) == self.our_group() {
            self.placement_cards(&address, n)
        } else {
            self.query(address, n, false, true).await
        };
        let peers = self.cards_to_peers(cards);
        if peers.is_empty() {
            return Err(Error::TooFewPeers);
        }
        Ok(peers)
    }

    async fn lookup(
        &self,
        address: Address,
        n: usize,
        fast: bool,
    ) -> Result<Vec<Arc<dyn Peer>>> {
        let cards = if self.group_of_address(&address) == self.our_group() {
            self.owner_cards(&address, n)
        } else {
            self.query(address, n, fast, false).await
        };
        Ok(self.cards_to_peers(cards))
    }

    async fn lookup_node(&self, id: NodeId) -> Result<Arc<dyn Peer>> {
        if id == self.source.local_id()
            || self.state.lock().expect("gossip state poisoned").contacts.contains_key(&id)
        {
            return Ok(self.source.peer(id));
        }
        Err(unknown_node(&id))
    }

    async fn discover(&self, locations: Vec<NodeLocation>) {
        for location in locations {
            if location.id.is_null() {
                // Rendezvous or bootstrap hint: ping the gossip port, the
                // pong will introduce the node properly.
                for endpoint in &location.endpoints {
                    let target = SocketAddr::new(
                        endpoint.ip,
                        endpoint.port.wrapping_add(GOSSIP_PORT_OFFSET),
                    );
                    self.send_to(target, &Packet::Ping(self.own_card())).await;
                }
                continue;
            }
            self.admit(ContactCard {
                id: location.id,
                endpoints: location.endpoints.clone(),
                observer: false,
            });
            self.send_to_contact(&location.id, &Packet::Ping(self.own_card())).await;
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.events.subscribe()
    }

    fn member_count(&self) -> usize {
        let state = self.state.lock().expect("gossip state poisoned");
        let contacts = state.contacts.values().filter(|c| !c.observer).count();
        contacts + usize::from(self.ctx.passport.capabilities.allow_storage)
    }
}
