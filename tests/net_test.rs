//! Network integration tests: full nodes over real sockets on localhost.
//!
//! Each test assembles a small cluster with `Node::start`, bootstraps the
//! mesh through endpoint hints, and drives block operations end to end —
//! handshake, encrypted channels, paxos RPCs, rebalancing under churn.

use burrow::config::{GossipConfig, NodeConfig, OverlayConfig, Protocol, SiloConfig};
use burrow::crypto::KeyPair;
use burrow::overlay::Overlay;
use burrow::passport::{Capabilities, Passport};
use burrow::{Context, Error, Node, NodeId};
use std::time::Duration;

/// Contexts sharing one network owner, wired to 127.0.0.1 with short
/// timeouts so churn tests converge quickly.
struct ClusterBuilder {
    owner: KeyPair,
    protocol: Protocol,
    replication: usize,
    overlay: OverlayConfig,
}

impl ClusterBuilder {
    fn new(protocol: Protocol, replication: usize) -> Self {
        Self {
            owner: KeyPair::generate(),
            protocol,
            replication,
            overlay: OverlayConfig::Flat,
        }
    }

    fn with_gossip(mut self) -> Self {
        self.overlay = OverlayConfig::Gossip(GossipConfig {
            gossip_interval_secs: 1,
            ..GossipConfig::default()
        });
        self
    }

    fn context(&self, bootstrap: Vec<String>) -> Context {
        let keys = KeyPair::generate();
        let passport = Passport::issue(
            &self.owner,
            keys.public().clone(),
            "burrow-test",
            Capabilities::default(),
        );
        let config = NodeConfig {
            network: "burrow-test".into(),
            replication_factor: self.replication,
            protocol: self.protocol,
            listen_address: "127.0.0.1".parse().unwrap(),
            port: 0,
            overlay: self.overlay.clone(),
            silo: Some(SiloConfig::Memory { capacity: None }),
            bootstrap,
            connect_timeout: Duration::from_secs(2),
            rpc_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_millis(200),
            ping_timeout: Duration::from_millis(500),
            node_timeout: Duration::from_secs(1),
            ..NodeConfig::default()
        };
        Context::new(
            NodeId::random(),
            keys,
            self.owner.public().clone(),
            passport,
            config,
        )
    }

    /// Start `n` nodes, each bootstrapping to all earlier ones.
    async fn start(&self, n: usize) -> Vec<Node> {
        let mut nodes: Vec<Node> = Vec::new();
        for _ in 0..n {
            let bootstrap = nodes
                .iter()
                .map(|node| node.listen_addr().expect("listening").to_string())
                .collect();
            let node = Node::start(self.context(bootstrap)).await.expect("node starts");
            nodes.push(node);
        }
        // Let discovery settle into a full mesh.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if nodes.iter().all(|node| node.overlay().member_count() >= n) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "mesh did not form");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        nodes
    }
}

async fn replica_count(nodes: &[Node], address: burrow::Address) -> usize {
    let mut count = 0;
    for node in nodes {
        if node
            .local_peer()
            .server()
            .reconcile(address)
            .await
            .unwrap_or(false)
        {
            count += 1;
        }
    }
    count
}

#[tokio::test]
async fn three_node_mesh_stores_and_serves_blocks() {
    let builder = ClusterBuilder::new(Protocol::Tcp, 3);
    let nodes = builder.start(3).await;

    let mut block = nodes[0].model().make_mutable_block();
    block.set_data(b"across the wire".to_vec()).unwrap();
    let address = nodes[0].model().insert(block, None).await.unwrap();

    for node in &nodes[1..] {
        let fetched = node.model().fetch(address, None).await.unwrap().unwrap();
        assert_eq!(fetched.data(), b"across the wire");
        fetched.validate().unwrap();
    }
    assert_eq!(replica_count(&nodes, address).await, 3);

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn utp_transport_carries_the_same_protocol() {
    let builder = ClusterBuilder::new(Protocol::Utp, 2);
    let nodes = builder.start(2).await;

    let block = nodes[0]
        .model()
        .make_immutable_block(b"datagram payload".to_vec(), None);
    let address = nodes[0].model().insert(block, None).await.unwrap();

    let fetched = nodes[1].model().fetch(address, None).await.unwrap().unwrap();
    assert_eq!(fetched.data(), b"datagram payload");

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn gossip_overlay_routes_blocks_too() {
    let builder = ClusterBuilder::new(Protocol::Tcp, 2).with_gossip();
    let nodes = builder.start(2).await;

    let block = nodes[0]
        .model()
        .make_immutable_block(b"gossiped content".to_vec(), None);
    let address = nodes[0].model().insert(block, None).await.unwrap();

    // The file index spreads by gossip; give it a few rounds.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        match nodes[1].model().fetch(address, None).await {
            Ok(Some(fetched)) => {
                assert_eq!(fetched.data(), b"gossiped content");
                break;
            }
            _ => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "gossip lookup did not converge"
                );
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        }
    }

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn local_version_spares_the_block_transfer() {
    let builder = ClusterBuilder::new(Protocol::Tcp, 2);
    let nodes = builder.start(2).await;

    let mut block = nodes[0].model().make_mutable_block();
    block.set_data(b"cached".to_vec()).unwrap();
    let address = nodes[0].model().insert(block, None).await.unwrap();

    let current = nodes[1].model().fetch(address, None).await.unwrap().unwrap();
    assert_eq!(current.version(), 1);
    // Asking again with the version we hold returns the sentinel.
    let unchanged = nodes[1].model().fetch(address, Some(1)).await.unwrap();
    assert!(unchanged.is_none());

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn dead_owner_is_replaced_within_the_timeout() {
    let builder = ClusterBuilder::new(Protocol::Tcp, 3);
    let nodes = builder.start(4).await;

    let mut block = nodes[0].model().make_mutable_block();
    block.set_data(b"needs three replicas".to_vec()).unwrap();
    let address = nodes[0].model().insert(block, None).await.unwrap();
    assert_eq!(replica_count(&nodes, address).await, 3);

    // Kill one owner outright (no resign: this is the crash path).
    let mut owner_index = None;
    let mut spare_index = None;
    for (i, node) in nodes.iter().enumerate() {
        if node.local_peer().server().reconcile(address).await.unwrap() {
            owner_index.get_or_insert(i);
        } else {
            spare_index = Some(i);
        }
    }
    let owner_index = owner_index.expect("an owner");
    let spare_index = spare_index.expect("a spare");
    nodes[owner_index].shutdown().await;

    // Within node_timeout plus a few rebalance beats, the spare holds a
    // valid replica and the live count is back at target.
    let live: Vec<&Node> = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != owner_index)
        .map(|(_, n)| n)
        .collect();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let mut count = 0;
        for node in &live {
            if node
                .local_peer()
                .server()
                .reconcile(address)
                .await
                .unwrap_or(false)
            {
                count += 1;
            }
        }
        if count >= 3 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "replication did not recover after owner loss"
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let replica = nodes[spare_index]
        .local_peer()
        .server()
        .fetch(address, None)
        .await
        .unwrap()
        .unwrap();
    replica.validate().unwrap();
    assert_eq!(replica.data(), b"needs three replicas");

    for (i, node) in nodes.iter().enumerate() {
        if i != owner_index {
            node.shutdown().await;
        }
    }
}

#[tokio::test]
async fn writes_fail_cleanly_without_a_majority() {
    let builder = ClusterBuilder::new(Protocol::Tcp, 3);
    let nodes = builder.start(3).await;

    let mut block = nodes[0].model().make_mutable_block();
    block.set_data(b"quorum bound".to_vec()).unwrap();
    let address = nodes[0].model().insert(block, None).await.unwrap();

    // Two of three owners gone: updates cannot assemble a majority.
    nodes[1].shutdown().await;
    nodes[2].shutdown().await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut stale = nodes[0]
        .model()
        .fetch(address, None)
        .await
        .unwrap()
        .unwrap();
    stale.set_data(b"doomed".to_vec()).unwrap();
    let result = nodes[0].model().update(stale, None, false).await;
    assert!(matches!(result, Err(Error::TooFewPeers) | Err(Error::TimeOut)));

    nodes[0].shutdown().await;
}
