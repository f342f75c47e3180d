//! Shared primitive types: wire version, endpoints, time, retry backoff.

use crate::address::NodeId;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// 32-byte SHA3-256 digest.
pub type Hash = [u8; 32];

/// Detached signature bytes (ML-DSA-65).
pub type Signature = Vec<u8>;

/// Seconds since the unix epoch.
pub fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// =============================================================================
// WIRE VERSION
// =============================================================================

/// Semantic version triple leading every serialized envelope and every
/// handshake. Peers and formats degrade to the lower of two versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self { major, minor, patch }
    }

    /// Version this build serializes with by default.
    pub const CURRENT: Version = Version::new(0, 3, 0);

    /// Oldest version this build still deserializes.
    pub const LOWEST: Version = Version::new(0, 1, 0);

    pub fn supported(&self) -> bool {
        *self >= Version::LOWEST && *self <= Version::CURRENT
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// =============================================================================
// ENDPOINTS
// =============================================================================

/// A reachable `host:port`. The same port number serves TCP and, when the
/// UTP transport is enabled, UDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self { ip: addr.ip(), port: addr.port() }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

impl FromStr for Endpoint {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SocketAddr::from_str(s).map(Endpoint::from)
    }
}

pub type Endpoints = Vec<Endpoint>;

/// A peer's identity plus where it can be dialed. The id may be null when
/// only the endpoints are known (bootstrap hints); handshake fills it in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeLocation {
    pub id: NodeId,
    pub endpoints: Endpoints,
}

impl NodeLocation {
    pub fn new(id: NodeId, endpoints: Endpoints) -> Self {
        Self { id, endpoints }
    }
}

impl fmt::Display for NodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} endpoints", self.id, self.endpoints.len())
    }
}

/// Parse an endpoints file: one `host:port` per line, `#` comments allowed.
pub fn parse_endpoints(contents: &str) -> Result<Endpoints, std::net::AddrParseError> {
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(Endpoint::from_str)
        .collect()
}

// =============================================================================
// RETRY BACKOFF
// =============================================================================

/// First retry delay (100 ms).
pub const BACKOFF_INITIAL_MS: u64 = 100;

/// Delay cap after doubling (25.6 s = 100 ms << 8).
pub const BACKOFF_CAP_MS: u64 = 25_600;

/// Attempts before a transport fault escalates to the caller.
pub const BACKOFF_MAX_ATTEMPTS: u32 = 8;

/// Bounded jittered backoff: doubles from 100 ms to the cap over 8 attempts,
/// each delay jittered by ±25 %.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    /// Delay before the next attempt, or None once the schedule is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= BACKOFF_MAX_ATTEMPTS {
            return None;
        }
        let base = (BACKOFF_INITIAL_MS << self.attempt).min(BACKOFF_CAP_MS);
        self.attempt += 1;
        let jitter = base / 4;
        let low = base.saturating_sub(jitter);
        let high = base + jitter;
        let ms = rand::thread_rng().gen_range(low..=high);
        Some(Duration::from_millis(ms))
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
