//! Node assembly: context, silo, dock, overlay, consensus and the model
//! façade wired together, with ordered shutdown.

use crate::config::{OverlayConfig, SiloConfig};
use crate::consensus::server::ConsensusServer;
use crate::consensus::Consensus;
use crate::context::Context;
use crate::dock::Dock;
use crate::error::{Error, Result};
use crate::model::Model;
use crate::overlay::{FlatOverlay, GossipOverlay, Overlay, PeerSource};
use crate::peer::LocalPeer;
use crate::silo::{self, MemorySilo, Silo};
use crate::types::{Endpoint, NodeLocation};
use crate::NodeId;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Node {
    ctx: Arc<Context>,
    dock: Arc<Dock>,
    overlay: Arc<dyn Overlay>,
    gossip: Option<Arc<GossipOverlay>>,
    consensus: Arc<Consensus>,
    local: Arc<LocalPeer>,
    model: Model,
}

impl Node {
    /// Bring a node up: storage, listener, overlay, consensus.
    pub async fn start(ctx: Context) -> Result<Node> {
        let ctx = Arc::new(ctx);
        let storage_node = ctx.passport.capabilities.allow_storage;

        // Observers keep a throwaway in-memory silo: they host no
        // replicas but still answer protocol probes about their own id.
        let silo: Arc<dyn Silo> = match (&ctx.config.silo, storage_node) {
            (Some(config), _) => silo::from_config(config).map_err(Error::other)?,
            (None, true) => {
                warn!("storage node without a silo configured, using memory");
                Arc::new(MemorySilo::new(None))
            }
            (None, false) => Arc::new(MemorySilo::new(None)),
        };

        let dock = Dock::new(ctx.clone());
        let server = ConsensusServer::new(ctx.clone(), silo.clone());
        let local = LocalPeer::new(ctx.clone(), server);
        dock.set_handler(local.dispatcher());

        let listen = SocketAddr::new(ctx.config.listen_address, ctx.config.port);
        let bound = dock.listen(listen).await?;
        info!(node = %ctx.id, %bound, "node listening");

        let source = PeerSource::new(dock.clone(), local.clone());
        let (overlay, gossip): (Arc<dyn Overlay>, Option<Arc<GossipOverlay>>) =
            match &ctx.config.overlay {
                OverlayConfig::Flat => (FlatOverlay::new(ctx.clone(), source), None),
                OverlayConfig::Gossip(config) => {
                    let gossip = GossipOverlay::new(ctx.clone(), source, config.clone());
                    (gossip.clone(), Some(gossip))
                }
            };

        // Locally stored addresses feed the overlay's file index.
        if let Some(gossip) = &gossip {
            let notifier_gossip = gossip.clone();
            silo.register_notifier(Arc::new(move |address, _delta| {
                notifier_gossip.publish(address);
            }));
            for address in silo.list().await.map_err(Error::other)? {
                gossip.publish(address);
            }
        }

        let consensus = Consensus::new(ctx.clone(), overlay.clone(), Some(local.clone()));
        let model = Model::new(ctx.clone(), consensus.clone());

        let node = Node { ctx, dock, overlay, gossip, consensus, local, model };
        node.bootstrap().await;
        if let Some(gossip) = &node.gossip {
            gossip.wait_ready().await;
        }
        Ok(node)
    }

    /// Feed configured bootstrap endpoints and the rendezvous relay to
    /// the overlay.
    async fn bootstrap(&self) {
        let mut hints = Vec::new();
        let mut sources: Vec<&str> =
            self.ctx.config.bootstrap.iter().map(String::as_str).collect();
        if let Some(rdv) = &self.ctx.config.rdv_host {
            sources.push(rdv.as_str());
        }
        for source in sources {
            match tokio::net::lookup_host(source).await {
                Ok(addrs) => {
                    let endpoints: Vec<Endpoint> = addrs.map(Endpoint::from).collect();
                    if !endpoints.is_empty() {
                        hints.push(NodeLocation::new(NodeId::NULL, endpoints));
                    }
                }
                Err(e) => warn!(%source, "bootstrap endpoint did not resolve: {e}"),
            }
        }
        if !hints.is_empty() {
            self.overlay.discover(hints).await;
        }
    }

    pub fn id(&self) -> NodeId {
        self.ctx.id
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn consensus(&self) -> &Arc<Consensus> {
        &self.consensus
    }

    pub fn overlay(&self) -> &Arc<dyn Overlay> {
        &self.overlay
    }

    pub fn dock(&self) -> &Arc<Dock> {
        &self.dock
    }

    pub fn local_peer(&self) -> &Arc<LocalPeer> {
        &self.local
    }

    /// The address remote peers can dial.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.dock.listen_addr()
    }

    /// Ordered teardown: hand replicas over (when configured), drain
    /// in-flight RPCs under a bound, then drop the channels; storage
    /// goes last with the node itself.
    pub async fn shutdown(&self) {
        if self.ctx.config.resign_on_shutdown {
            info!(node = %self.ctx.id, "resigning from quorums");
            self.consensus.resign().await;
        }
        let deadline = tokio::time::Instant::now()
            + std::time::Duration::from_secs(crate::config::DRAIN_TIMEOUT_SECS);
        while self.dock.pending_total() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        }
        self.dock.shutdown();
        info!(node = %self.ctx.id, "node stopped");
    }
}

/// Convenience used by the binary and tests: a context whose silo is a
/// plain directory under `data_dir`.
pub fn directory_silo_config(data_dir: &std::path::Path) -> SiloConfig {
    SiloConfig::Directory { path: data_dir.join("blocks"), capacity: None }
}
