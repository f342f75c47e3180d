//! The dock: connection pool and transport plane.
//!
//! At most one authenticated channel per peer id. Dialing is idempotent
//! under concurrency — a `reconnecting` guard makes late callers wait for
//! the in-flight attempt instead of racing their own dial. Closed
//! connections are evicted by the maintenance loop, which also drives
//! keepalive pings.

pub mod channel;
pub mod handshake;
pub mod rpc;
pub mod transport;
pub mod utp;

pub use channel::Connection;
pub use rpc::{RemoteInfo, RpcHandler};

use crate::address::NodeId;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::types::{Endpoint, Endpoints};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockEvent {
    Connected(NodeId),
    Disconnected(NodeId),
}

/// Handler indirection: connections may be accepted before the node has
/// wired its dispatcher.
struct HandlerCell(RwLock<Option<Arc<dyn RpcHandler>>>);

#[async_trait::async_trait]
impl RpcHandler for HandlerCell {
    async fn handle(&self, remote: &RemoteInfo, name: &str, body: &[u8]) -> Result<Vec<u8>> {
        let handler = self.0.read().expect("handler cell poisoned").clone();
        match handler {
            Some(handler) => handler.handle(remote, name, body).await,
            None => Err(Error::other("node not serving yet")),
        }
    }
}

pub struct Dock {
    ctx: Arc<Context>,
    handler: Arc<HandlerCell>,
    connections: Mutex<HashMap<NodeId, Arc<Connection>>>,
    reconnecting: Mutex<HashSet<NodeId>>,
    /// Last known endpoints per peer, refreshed by the overlay.
    locations: Mutex<HashMap<NodeId, Endpoints>>,
    events: broadcast::Sender<DockEvent>,
    listen_addr: std::sync::OnceLock<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Dock {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dock = Arc::new(Self {
            ctx,
            handler: Arc::new(HandlerCell(RwLock::new(None))),
            connections: Mutex::new(HashMap::new()),
            reconnecting: Mutex::new(HashSet::new()),
            locations: Mutex::new(HashMap::new()),
            events,
            listen_addr: std::sync::OnceLock::new(),
            shutdown_tx,
            shutdown_rx,
        });
        dock.clone().spawn_maintenance();
        dock
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn set_handler(&self, handler: Arc<dyn RpcHandler>) {
        *self.handler.0.write().expect("handler cell poisoned") = Some(handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DockEvent> {
        self.events.subscribe()
    }

    /// Where the acceptor is bound, once `listen` has run.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr.get().copied()
    }

    /// Record where a peer can be dialed; used on connect and reconnect.
    pub fn learn_location(&self, id: NodeId, endpoints: Endpoints) {
        if !endpoints.is_empty() {
            self.locations.lock().expect("locations poisoned").insert(id, endpoints);
        }
    }

    pub fn endpoints_of(&self, id: &NodeId) -> Endpoints {
        self.locations
            .lock()
            .expect("locations poisoned")
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.connections
            .lock()
            .expect("connections poisoned")
            .iter()
            .filter(|(_, c)| !c.is_closed())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Authenticated info for a live connection, if any.
    pub fn peer_info(&self, id: &NodeId) -> Option<rpc::RemoteInfo> {
        self.connections
            .lock()
            .expect("connections poisoned")
            .get(id)
            .filter(|c| !c.is_closed())
            .map(|c| c.info().clone())
    }

    pub fn is_connected(&self, id: &NodeId) -> bool {
        self.connections
            .lock()
            .expect("connections poisoned")
            .get(id)
            .map(|c| !c.is_closed())
            .unwrap_or(false)
    }

    // =========================================================================
    // LISTENING
    // =========================================================================

    /// Bind the acceptor and serve inbound connections until shutdown.
    pub async fn listen(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr> {
        let mut acceptor =
            transport::Acceptor::bind(addr, self.ctx.config.protocol).await?;
        let local = acceptor.local_addr();
        let _ = self.listen_addr.set(local);
        info!(%local, "dock listening");

        let dock = self.clone();
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            loop {
                let pair = tokio::select! {
                    res = acceptor.accept() => match res {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        }
                    },
                    _ = shutdown.changed() => return,
                };
                let dock = dock.clone();
                tokio::spawn(async move {
                    let mut pair = pair;
                    match handshake::accept(&dock.ctx, &mut pair).await {
                        Ok(hs) => {
                            dock.admit(pair, hs);
                        }
                        Err(e) => debug!("inbound handshake failed: {e}"),
                    }
                });
            }
        });
        Ok(local)
    }

    fn admit(self: &Arc<Self>, pair: transport::WirePair, hs: handshake::Handshake) {
        if hs.remote_id == self.ctx.id {
            debug!("refusing self-connection");
            return;
        }
        let id = hs.remote_id;
        let connection = Connection::spawn(
            pair,
            hs,
            self.handler.clone() as Arc<dyn RpcHandler>,
            self.ctx.config.rpc_timeout,
        );
        let previous = self
            .connections
            .lock()
            .expect("connections poisoned")
            .insert(id, connection);
        if let Some(previous) = previous {
            previous.close();
        }
        let _ = self.events.send(DockEvent::Connected(id));
    }

    // =========================================================================
    // DIALING
    // =========================================================================

    /// Dial raw endpoints (bootstrap: the peer id is unknown until the
    /// handshake names it).
    pub async fn connect_endpoints(self: &Arc<Self>, endpoints: &[Endpoint]) -> Result<NodeId> {
        let connection = self.dial_any(endpoints).await?;
        let id = connection.info().id;
        self.learn_location(id, endpoints.to_vec());
        Ok(id)
    }

    /// The channel to a peer, dialing if necessary. Concurrent callers
    /// for the same id share one attempt.
    pub async fn connection(self: &Arc<Self>, id: NodeId) -> Result<Arc<Connection>> {
        loop {
            if let Some(existing) = self.live_connection(&id) {
                return Ok(existing);
            }
            // One dialer at a time per id; late callers poll for the
            // winner's result.
            let i_dial = self.reconnecting.lock().expect("reconnecting poisoned").insert(id);
            if !i_dial {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                continue;
            }

            let endpoints = self.endpoints_of(&id);
            let result = if endpoints.is_empty() {
                Err(Error::other(format!("no known endpoints for {id:?}")))
            } else {
                self.dial_any(&endpoints).await
            };

            self.reconnecting.lock().expect("reconnecting poisoned").remove(&id);

            let connection = result?;
            if connection.info().id != id {
                connection.close();
                return Err(Error::HandshakeFailed(format!(
                    "endpoint answered as {:?}, expected {:?}",
                    connection.info().id,
                    id
                )));
            }
            return Ok(connection);
        }
    }

    fn live_connection(&self, id: &NodeId) -> Option<Arc<Connection>> {
        let mut connections = self.connections.lock().expect("connections poisoned");
        match connections.get(id) {
            Some(c) if !c.is_closed() => Some(c.clone()),
            Some(_) => {
                connections.remove(id);
                None
            }
            None => None,
        }
    }

    async fn dial_any(self: &Arc<Self>, endpoints: &[Endpoint]) -> Result<Arc<Connection>> {
        let config = &self.ctx.config;
        let mut last_err = Error::other("no endpoints to dial");
        for endpoint in endpoints {
            match transport::dial(endpoint.socket_addr(), config.protocol, config.connect_timeout)
                .await
            {
                Ok(mut pair) => match handshake::connect(&self.ctx, &mut pair).await {
                    Ok(hs) => {
                        if hs.remote_id == self.ctx.id {
                            return Err(Error::HandshakeFailed("dialed ourselves".into()));
                        }
                        let id = hs.remote_id;
                        let connection = Connection::spawn(
                            pair,
                            hs,
                            self.handler.clone() as Arc<dyn RpcHandler>,
                            config.rpc_timeout,
                        );
                        let previous = self
                            .connections
                            .lock()
                            .expect("connections poisoned")
                            .insert(id, connection.clone());
                        if let Some(previous) = previous {
                            previous.close();
                        }
                        let _ = self.events.send(DockEvent::Connected(id));
                        return Ok(connection);
                    }
                    Err(e) => last_err = e,
                },
                Err(e) => last_err = e.into(),
            }
        }
        Err(last_err)
    }

    // =========================================================================
    // MAINTENANCE
    // =========================================================================

    fn spawn_maintenance(self: Arc<Self>) {
        let mut shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move {
            let interval = self.ctx.config.ping_interval;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => return,
                }
                let connections: Vec<(NodeId, Arc<Connection>)> = self
                    .connections
                    .lock()
                    .expect("connections poisoned")
                    .iter()
                    .map(|(id, c)| (*id, c.clone()))
                    .collect();
                for (id, connection) in connections {
                    if connection.is_closed() {
                        self.evict(&id);
                        continue;
                    }
                    let ping_timeout = self.ctx.config.ping_timeout;
                    match tokio::time::timeout(ping_timeout, connection.ping()).await {
                        Ok(Ok(())) => {}
                        _ => {
                            debug!(peer = ?id, "ping failed, evicting connection");
                            connection.close();
                            self.evict(&id);
                        }
                    }
                }
            }
        });
    }

    fn evict(&self, id: &NodeId) {
        let removed = {
            let mut connections = self.connections.lock().expect("connections poisoned");
            match connections.get(id) {
                Some(c) if c.is_closed() => connections.remove(id),
                _ => None,
            }
        };
        if removed.is_some() {
            let _ = self.events.send(DockEvent::Disconnected(*id));
        }
    }

    /// RPCs in flight across every connection.
    pub fn pending_total(&self) -> usize {
        self.connections
            .lock()
            .expect("connections poisoned")
            .values()
            .map(|c| c.pending_calls())
            .sum()
    }

    /// Close everything: stop accepting, then drop every channel.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let connections: Vec<Arc<Connection>> = self
            .connections
            .lock()
            .expect("connections poisoned")
            .drain()
            .map(|(_, c)| c)
            .collect();
        for connection in connections {
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::crypto::KeyPair;
    use crate::passport::{Capabilities, Passport};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl RpcHandler for Echo {
        async fn handle(&self, _remote: &RemoteInfo, _name: &str, body: &[u8]) -> Result<Vec<u8>> {
            Ok(body.to_vec())
        }
    }

    fn make_context(owner: &KeyPair) -> Arc<Context> {
        let keys = KeyPair::generate();
        let passport = Passport::issue(
            owner,
            keys.public().clone(),
            "burrow",
            Capabilities::default(),
        );
        Arc::new(Context::new(
            NodeId::random(),
            keys,
            owner.public().clone(),
            passport,
            NodeConfig::default(),
        ))
    }

    #[tokio::test]
    async fn dial_by_id_reuses_the_connection() {
        let owner = KeyPair::generate();
        let server_ctx = make_context(&owner);
        let client_ctx = make_context(&owner);
        let server_id = server_ctx.id;

        let server_dock = Dock::new(server_ctx);
        server_dock.set_handler(Arc::new(Echo));
        let addr = server_dock.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let client_dock = Dock::new(client_ctx);
        client_dock.set_handler(Arc::new(Echo));
        client_dock.learn_location(server_id, vec![Endpoint::from(addr)]);

        let c1 = client_dock.connection(server_id).await.unwrap();
        let c2 = client_dock.connection(server_id).await.unwrap();
        assert!(Arc::ptr_eq(&c1, &c2));
        assert_eq!(c1.call_raw("echo", b"hello".to_vec()).await.unwrap(), b"hello");

        server_dock.shutdown();
        client_dock.shutdown();
    }

    #[tokio::test]
    async fn bootstrap_by_endpoint_learns_the_id() {
        let owner = KeyPair::generate();
        let server_ctx = make_context(&owner);
        let expected_id = server_ctx.id;

        let server_dock = Dock::new(server_ctx);
        server_dock.set_handler(Arc::new(Echo));
        let addr = server_dock.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let client_dock = Dock::new(make_context(&owner));
        client_dock.set_handler(Arc::new(Echo));
        let id = client_dock.connect_endpoints(&[Endpoint::from(addr)]).await.unwrap();
        assert_eq!(id, expected_id);
        assert!(client_dock.is_connected(&id));

        server_dock.shutdown();
        client_dock.shutdown();
    }
}
