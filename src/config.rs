//! Node configuration: replication, transports, overlay topology, silo
//! backends, timeouts. Every default is stated next to its rationale.

use crate::types::Version;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// DEFAULTS
// =============================================================================

/// Replication target ℛ. Three replicas tolerate one silent peer while a
/// majority of two still commits.
pub const DEFAULT_REPLICATION_FACTOR: usize = 3;

/// Dial timeout. 5 s covers high-latency links without letting a dead
/// endpoint stall quorum assembly.
pub const CONNECT_TIMEOUT_SECS: u64 = 5;

/// Per-RPC timeout. Block transfers dominate; 10 s fits a 2 MB payload on
/// slow uplinks.
pub const RPC_TIMEOUT_SECS: u64 = 10;

/// Interval between keepalive pings on idle connections.
pub const PING_INTERVAL_SECS: u64 = 30;

/// A peer missing a ping reply within this window is treated as gone from
/// the connection's point of view (the overlay decides disappearance).
pub const PING_TIMEOUT_SECS: u64 = 10;

/// A peer silent this long is considered gone and its blocks become
/// candidates for eviction-driven rebalancing.
pub const NODE_TIMEOUT_SECS: u64 = 600;

/// Bound on pending RPC draining during shutdown.
pub const DRAIN_TIMEOUT_SECS: u64 = 5;

/// Conflict-resolution retries before an update gives up (resolvers may
/// lower this).
pub const DEFAULT_CONFLICT_RETRIES: u32 = 20;

// =============================================================================
// TRANSPORT SELECTION
// =============================================================================

/// Which transports the dock may dial and accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Utp,
    /// Prefer UTP, fall back to TCP.
    All,
}

impl Protocol {
    pub fn with_tcp(&self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::All)
    }

    pub fn with_utp(&self) -> bool {
        matches!(self, Protocol::Utp | Protocol::All)
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::All
    }
}

// =============================================================================
// OVERLAY
// =============================================================================

/// Gossip fanout per tick, by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipFanout {
    /// File-index entries pushed per gossip round.
    pub files: usize,
    /// Contacts from our own group.
    pub contacts_group: usize,
    /// Contacts from other groups.
    pub contacts_other: usize,
}

impl Default for GossipFanout {
    fn default() -> Self {
        Self { files: 6, contacts_group: 3, contacts_other: 3 }
    }
}

/// Group-gossip overlay parameters. Defaults follow the original overlay's
/// operating points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Number of groups nodes hash into. 1 degenerates to a flat index.
    pub k: usize,
    /// Bounded sample of contacts kept per foreign group.
    pub max_other_contacts: usize,
    /// Seconds between gossip rounds.
    pub gossip_interval_secs: u64,
    /// An entry gossiped fewer times than this is "new" and prioritized.
    pub new_threshold: usize,
    /// Seconds after which an entry is "old" and gossiped rarely.
    pub old_threshold_secs: u64,
    pub fanout: GossipFanout,
    /// Seconds to wait for one query reply.
    pub query_timeout_secs: u64,
    pub query_get_retries: u32,
    pub query_put_retries: u32,
    pub query_get_ttl: u32,
    pub query_put_ttl: u32,
    /// Seconds without any packet before a contact is dropped.
    pub contact_timeout_secs: u64,
    /// Seconds before an unrefreshed file-index entry expires.
    pub file_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub ping_timeout_secs: u64,
    /// Block startup until this many storage nodes are visible.
    pub wait_nodes: usize,
    /// Seal gossip packets to the network key.
    pub encrypt: bool,
    /// Keep accepting plaintext packets (mixed-version rollouts).
    pub accept_plain: bool,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            k: 1,
            max_other_contacts: 6,
            gossip_interval_secs: 2,
            new_threshold: 5,
            old_threshold_secs: 40,
            fanout: GossipFanout::default(),
            query_timeout_secs: 1,
            query_get_retries: 30,
            query_put_retries: 12,
            query_get_ttl: 10,
            query_put_ttl: 10,
            contact_timeout_secs: 12,
            file_timeout_secs: 1200,
            ping_interval_secs: 1,
            ping_timeout_secs: 1,
            wait_nodes: 0,
            encrypt: false,
            accept_plain: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum OverlayConfig {
    /// Every node knows every node; right for small clusters.
    Flat,
    /// Consistent groups + bounded cross-group contacts.
    Gossip(GossipConfig),
}

impl Default for OverlayConfig {
    fn default() -> Self {
        OverlayConfig::Flat
    }
}

// =============================================================================
// SILO
// =============================================================================

/// How a composite silo spreads writes over its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompositeMode {
    /// Shard by leading address byte.
    Stripe,
    /// Write everywhere, read first hit.
    Mirror,
}

/// Silo backend selection. Remote object stores are enumerated for
/// configuration compatibility but construct only through an external
/// adapter; the core ships the local variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum SiloConfig {
    Directory {
        path: PathBuf,
        /// Optional byte cap enforced on set().
        capacity: Option<u64>,
    },
    Memory {
        capacity: Option<u64>,
    },
    Sled {
        path: PathBuf,
        capacity: Option<u64>,
    },
    S3 {
        endpoint: String,
        bucket: String,
        region: String,
        credentials: String,
        storage_class: Option<String>,
    },
    Gcs {
        token: String,
        root: String,
    },
    Dropbox {
        token: String,
        root: String,
    },
    GoogleDrive {
        token: String,
        root: String,
    },
    Composite {
        mode: CompositeMode,
        children: Vec<SiloConfig>,
    },
}

// =============================================================================
// NODE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network name this node participates in.
    pub network: String,
    /// Replication target ℛ; converged toward, not guaranteed.
    pub replication_factor: usize,
    pub protocol: Protocol,
    pub listen_address: IpAddr,
    pub port: u16,
    pub overlay: OverlayConfig,
    pub silo: Option<SiloConfig>,
    /// Rendezvous relay for discovery, `host:port`.
    pub rdv_host: Option<String>,
    /// Direct bootstrap endpoints, `host:port` each.
    pub bootstrap: Vec<String>,
    pub connect_timeout: Duration,
    pub rpc_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    /// Silence window before a peer counts as gone.
    pub node_timeout: Duration,
    /// Propose new owners when a quorum falls under ℛ.
    pub rebalance_auto_expand: bool,
    /// Scan local blocks for under-replication at startup.
    pub rebalance_inspect: bool,
    /// Drive self-removing rebalances before shutdown.
    pub resign_on_shutdown: bool,
    /// Store ACL payloads encrypted.
    pub encrypt_at_rest: bool,
    /// Compute and check block signatures (disabled only in benchmarks).
    pub validate_signatures: bool,
    /// Let anyone remove a named block that has no owner.
    pub allow_anonymous_named_removal: bool,
    /// Serialize in an older wire format for mixed-version clusters.
    pub compatibility_version: Option<Version>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: "burrow".into(),
            replication_factor: DEFAULT_REPLICATION_FACTOR,
            protocol: Protocol::default(),
            listen_address: IpAddr::from([0, 0, 0, 0]),
            port: 0,
            overlay: OverlayConfig::default(),
            silo: None,
            rdv_host: None,
            bootstrap: Vec::new(),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            rpc_timeout: Duration::from_secs(RPC_TIMEOUT_SECS),
            ping_interval: Duration::from_secs(PING_INTERVAL_SECS),
            ping_timeout: Duration::from_secs(PING_TIMEOUT_SECS),
            node_timeout: Duration::from_secs(NODE_TIMEOUT_SECS),
            rebalance_auto_expand: true,
            rebalance_inspect: true,
            resign_on_shutdown: false,
            encrypt_at_rest: true,
            validate_signatures: true,
            allow_anonymous_named_removal: false,
            compatibility_version: None,
        }
    }
}

impl NodeConfig {
    /// Wire version this node serializes with.
    pub fn wire_version(&self) -> Version {
        self.compatibility_version.unwrap_or(Version::CURRENT)
    }
}
