//! Burrow node binary.
//!
//! Runs one storage peer: loads or mints the node identity, joins the
//! configured network and serves blocks until interrupted. The first
//! node of a fresh network generates the owner key and certifies itself;
//! later nodes load the owner public key and a passport issued to them.

use burrow::config::{GossipConfig, NodeConfig, OverlayConfig, Protocol, SiloConfig};
use burrow::crypto::KeyPair;
use burrow::passport::{Capabilities, Passport};
use burrow::types::Version;
use burrow::{Context, Node, NodeId, PublicKey};
use clap::Parser;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "burrow", version, about = "Decentralized content-addressed block storage")]
struct Args {
    /// Network name to join
    #[arg(short, long, default_value = "burrow")]
    network: String,

    /// Listen port (0 picks a free one)
    #[arg(short, long, default_value = "7890")]
    port: u16,

    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0")]
    listen: IpAddr,

    /// Data directory (keys, passport, blocks)
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Bootstrap peers, host:port (comma-separated)
    #[arg(short, long)]
    bootstrap: Option<String>,

    /// Endpoints file: one host:port per line, # comments
    #[arg(long)]
    peers_file: Option<PathBuf>,

    /// Rendezvous relay, host:port
    #[arg(long)]
    rdv: Option<String>,

    /// Replication target per block
    #[arg(short = 'r', long, default_value = "3")]
    replication: usize,

    /// Transport: tcp, utp or all
    #[arg(long, default_value = "all")]
    protocol: String,

    /// Use the group-gossip overlay instead of the flat view
    #[arg(long)]
    gossip: bool,

    /// Serialize in an older wire format, e.g. 0.2.0
    #[arg(long)]
    compat: Option<String>,

    /// Hand replicas over before exiting
    #[arg(long)]
    resign: bool,

    /// Store ACL payloads unencrypted (benchmarks only)
    #[arg(long)]
    no_encrypt_at_rest: bool,
}

/// Load a postcard-serialized value, or create and persist one.
fn load_or_generate<T, F>(path: &Path, generate: F) -> std::io::Result<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
    F: FnOnce() -> T,
{
    if path.exists() {
        let bytes = std::fs::read(path)?;
        return postcard::from_bytes(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e));
    }
    let value = generate();
    let bytes = postcard::to_allocvec(&value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(value)
}

/// Assemble the node identity from the data directory. A directory that
/// has no owner material yet founds a new network: the owner key is
/// generated here and the node certifies itself.
fn load_identity(
    data_dir: &Path,
    network: &str,
) -> std::io::Result<(NodeId, KeyPair, PublicKey, Passport)> {
    std::fs::create_dir_all(data_dir)?;
    let keys: KeyPair = load_or_generate(&data_dir.join("identity.key"), KeyPair::generate)?;
    let id: NodeId = load_or_generate(&data_dir.join("node.id"), NodeId::random)?;

    let owner_pub_path = data_dir.join("owner.pub");
    let passport_path = data_dir.join("passport");
    if owner_pub_path.exists() && passport_path.exists() {
        let owner: PublicKey = postcard::from_bytes(&std::fs::read(&owner_pub_path)?)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let passport: Passport = postcard::from_bytes(&std::fs::read(&passport_path)?)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        return Ok((id, keys, owner, passport));
    }

    info!("no owner material found, founding network {network:?}");
    let owner_keys: KeyPair =
        load_or_generate(&data_dir.join("owner.key"), KeyPair::generate)?;
    let passport = Passport::issue(
        &owner_keys,
        keys.public().clone(),
        network,
        Capabilities { allow_write: true, allow_storage: true, allow_sign: true },
    );
    std::fs::write(
        &owner_pub_path,
        postcard::to_allocvec(owner_keys.public())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
    )?;
    std::fs::write(
        &passport_path,
        postcard::to_allocvec(&passport)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
    )?;
    Ok((id, keys, owner_keys.public().clone(), passport))
}

fn parse_version(s: &str) -> Option<Version> {
    let mut parts = s.split('.').map(|p| p.parse::<u8>().ok());
    match (parts.next()??, parts.next()??, parts.next()??) {
        (major, minor, patch) => Some(Version::new(major, minor, patch)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let protocol = match args.protocol.as_str() {
        "tcp" => Protocol::Tcp,
        "utp" => Protocol::Utp,
        "all" => Protocol::All,
        other => {
            error!("unknown protocol {other:?} (expected tcp, utp or all)");
            std::process::exit(2);
        }
    };
    let compatibility_version = match args.compat.as_deref() {
        None => None,
        Some(s) => match parse_version(s) {
            Some(v) => Some(v),
            None => {
                error!("unparsable compatibility version {s:?}");
                std::process::exit(2);
            }
        },
    };

    let (id, keys, owner, passport) = load_identity(&args.data_dir, &args.network)?;
    info!(node = %id, key = %keys.public(), "identity loaded");

    let config = NodeConfig {
        network: args.network,
        replication_factor: args.replication,
        protocol,
        listen_address: args.listen,
        port: args.port,
        overlay: if args.gossip {
            OverlayConfig::Gossip(GossipConfig::default())
        } else {
            OverlayConfig::Flat
        },
        silo: Some(SiloConfig::Directory {
            path: args.data_dir.join("blocks"),
            capacity: None,
        }),
        rdv_host: args.rdv,
        bootstrap: {
            let mut bootstrap: Vec<String> = args
                .bootstrap
                .map(|list| list.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default();
            if let Some(path) = &args.peers_file {
                let contents = std::fs::read_to_string(path)?;
                let endpoints = burrow::types::parse_endpoints(&contents)
                    .map_err(|e| format!("bad endpoints file {}: {e}", path.display()))?;
                bootstrap.extend(endpoints.iter().map(|e| e.to_string()));
            }
            bootstrap
        },
        resign_on_shutdown: args.resign,
        encrypt_at_rest: !args.no_encrypt_at_rest,
        compatibility_version,
        ..NodeConfig::default()
    };

    let ctx = Context::new(id, keys, owner, passport, config);
    let node = Node::start(ctx).await?;
    info!("node up; ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    node.shutdown().await;
    Ok(())
}
