//! Silo: the narrow local blob store under consensus.
//!
//! A silo maps addresses to opaque byte records and knows nothing about
//! blocks or quorums. Implementations are swappable behind one async
//! trait; a notifier fires after every mutation so the consensus layer can
//! refresh usage statistics.

mod composite;
mod directory;
mod memory;
mod sleddb;

pub use composite::CompositeSilo;
pub use directory::DirectorySilo;
pub use memory::MemorySilo;
pub use sleddb::SledSilo;

use crate::address::Address;
use crate::config::{CompositeMode, SiloConfig};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub type SiloResult<T> = std::result::Result<T, SiloError>;

#[derive(Debug, Error)]
pub enum SiloError {
    #[error("no record for {0}")]
    MissingKey(Address),
    #[error("record already exists for {0}")]
    Collision(Address),
    #[error("silo capacity exhausted ({usage}/{capacity} bytes)")]
    Capacity { usage: u64, capacity: u64 },
    #[error("backend: {0}")]
    Backend(String),
}

impl SiloError {
    pub fn backend(e: impl std::fmt::Display) -> Self {
        SiloError::Backend(e.to_string())
    }
}

/// Presence report for one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Present,
    Missing,
    /// The backend cannot answer cheaply (remote stores).
    Unknown,
}

/// Fired after any successful mutation, with the signed size delta.
pub type Notifier = Arc<dyn Fn(Address, i64) + Send + Sync>;

#[async_trait]
pub trait Silo: Send + Sync {
    async fn get(&self, address: Address) -> SiloResult<Vec<u8>>;

    /// Store bytes. `insert` fails on an existing record with
    /// `Collision`; `update` fails on an absent one with `MissingKey`.
    /// Returns the signed size delta.
    async fn set(
        &self,
        address: Address,
        data: Vec<u8>,
        insert: bool,
        update: bool,
    ) -> SiloResult<i64>;

    async fn erase(&self, address: Address) -> SiloResult<()>;

    async fn list(&self) -> SiloResult<Vec<Address>>;

    async fn status(&self, address: Address) -> SiloResult<BlockStatus>;

    /// Bytes currently stored.
    async fn usage(&self) -> SiloResult<u64>;

    /// Configured byte cap, if any.
    async fn capacity(&self) -> SiloResult<Option<u64>>;

    /// Register the mutation callback. One notifier per silo.
    fn register_notifier(&self, notifier: Notifier);
}

/// Build a silo from its configuration. Remote object stores need an
/// external adapter and are refused here.
pub fn from_config(config: &SiloConfig) -> SiloResult<Arc<dyn Silo>> {
    match config {
        SiloConfig::Directory { path, capacity } => {
            Ok(Arc::new(DirectorySilo::open(path, *capacity)?))
        }
        SiloConfig::Memory { capacity } => Ok(Arc::new(MemorySilo::new(*capacity))),
        SiloConfig::Sled { path, capacity } => Ok(Arc::new(SledSilo::open(path, *capacity)?)),
        SiloConfig::Composite { mode, children } => {
            let children = children.iter().map(from_config).collect::<SiloResult<Vec<_>>>()?;
            Ok(Arc::new(CompositeSilo::new(*mode, children)?))
        }
        SiloConfig::S3 { .. } => Err(SiloError::Backend(
            "s3 silo requires the external object-store adapter".into(),
        )),
        SiloConfig::Gcs { .. } | SiloConfig::Dropbox { .. } | SiloConfig::GoogleDrive { .. } => {
            Err(SiloError::Backend(
                "cloud-drive silos require the external object-store adapter".into(),
            ))
        }
    }
}

#[cfg(test)]
pub(crate) mod silo_tests {
    //! Contract checks shared by every backend.

    use super::*;

    pub async fn check_contract(silo: &dyn Silo) {
        let addr = Address::random();

        assert!(matches!(silo.get(addr).await, Err(SiloError::MissingKey(_))));
        assert_eq!(silo.status(addr).await.unwrap(), BlockStatus::Missing);

        // Update on an absent record fails.
        assert!(matches!(
            silo.set(addr, b"v".to_vec(), false, true).await,
            Err(SiloError::MissingKey(_))
        ));

        let delta = silo.set(addr, b"hello".to_vec(), true, false).await.unwrap();
        assert_eq!(delta, 5);
        assert_eq!(silo.get(addr).await.unwrap(), b"hello");
        assert_eq!(silo.status(addr).await.unwrap(), BlockStatus::Present);
        assert_eq!(silo.usage().await.unwrap(), 5);

        // Insert on an existing record collides.
        assert!(matches!(
            silo.set(addr, b"x".to_vec(), true, false).await,
            Err(SiloError::Collision(_))
        ));

        let delta = silo.set(addr, b"hi".to_vec(), false, true).await.unwrap();
        assert_eq!(delta, -3);
        assert_eq!(silo.usage().await.unwrap(), 2);

        let listed = silo.list().await.unwrap();
        assert!(listed.contains(&addr));

        silo.erase(addr).await.unwrap();
        assert!(matches!(silo.erase(addr).await, Err(SiloError::MissingKey(_))));
        assert_eq!(silo.usage().await.unwrap(), 0);
    }
}
