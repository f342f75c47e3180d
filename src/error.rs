//! Error kinds surfaced at the storage-core boundary.
//!
//! Propagation policy: transport faults retry with bounded jittered
//! backoff; validation failures never retry (they indicate adversarial or
//! corrupt data); conflicts go to the caller's resolver; a missing block is
//! retried once through consensus recovery, then surfaced.

use crate::address::Address;
use crate::blocks::Block;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum Error {
    /// No replica can produce the block.
    #[error("missing block {0}")]
    MissingBlock(Address),

    /// Signature, hash or permission check failed at a peer.
    #[error("validation failed: {0}")]
    ValidationFailed(String),

    /// Insert on an address that already holds a block.
    #[error("collision at {0}")]
    Collision(Address),

    /// Paxos could not assemble a majority; retryable.
    #[error("too few peers to reach a quorum")]
    TooFewPeers,

    /// Concurrent mutation detected; carries the chosen version and, when
    /// available, the chosen block for the resolver.
    #[error("conflict with chosen version {version}")]
    Conflict {
        version: u64,
        current: Option<Box<Block>>,
    },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("operation timed out")]
    TimeOut,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Caller not present in the block's permission list.
    #[error("permission denied")]
    PermissionDenied,

    /// Typed consensus rejection (stale proposal, quorum mismatch, ...).
    #[error(transparent)]
    Paxos(#[from] crate::consensus::paxos::PaxosError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Transport faults retry transparently; everything else escalates.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ConnectionClosed | Error::TimeOut | Error::TooFewPeers
        )
    }

    pub fn other(msg: impl std::fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Error::TimeOut,
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => Error::ConnectionClosed,
            _ => Error::Other(e.to_string()),
        }
    }
}

impl From<crate::crypto::CryptoError> for Error {
    fn from(e: crate::crypto::CryptoError) -> Self {
        Error::ValidationFailed(e.to_string())
    }
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Error::Other(format!("serialization: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::TimeOut.is_transient());
        assert!(Error::ConnectionClosed.is_transient());
        assert!(Error::TooFewPeers.is_transient());
        assert!(!Error::PermissionDenied.is_transient());
        assert!(!Error::ValidationFailed("bad signature".into()).is_transient());
    }

    #[test]
    fn io_error_mapping() {
        let e: Error = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(matches!(e, Error::ConnectionClosed));
        let e: Error = std::io::Error::from(std::io::ErrorKind::TimedOut).into();
        assert!(matches!(e, Error::TimeOut));
    }
}
