//! Composite silo: stripe or mirror over child silos.

use super::{BlockStatus, Notifier, Silo, SiloError, SiloResult};
use crate::address::Address;
use crate::config::CompositeMode;
use async_trait::async_trait;
use std::sync::Arc;

pub struct CompositeSilo {
    mode: CompositeMode,
    children: Vec<Arc<dyn Silo>>,
}

impl CompositeSilo {
    pub fn new(mode: CompositeMode, children: Vec<Arc<dyn Silo>>) -> SiloResult<Self> {
        if children.is_empty() {
            return Err(SiloError::Backend("composite silo needs at least one child".into()));
        }
        Ok(Self { mode, children })
    }

    /// Stripe target: shard by leading address byte.
    fn child_for(&self, address: Address) -> &Arc<dyn Silo> {
        let index = address.0[0] as usize % self.children.len();
        &self.children[index]
    }
}

#[async_trait]
impl Silo for CompositeSilo {
    async fn get(&self, address: Address) -> SiloResult<Vec<u8>> {
        match self.mode {
            CompositeMode::Stripe => self.child_for(address).get(address).await,
            CompositeMode::Mirror => {
                for child in &self.children {
                    match child.get(address).await {
                        Ok(data) => return Ok(data),
                        Err(SiloError::MissingKey(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Err(SiloError::MissingKey(address))
            }
        }
    }

    async fn set(
        &self,
        address: Address,
        data: Vec<u8>,
        insert: bool,
        update: bool,
    ) -> SiloResult<i64> {
        match self.mode {
            CompositeMode::Stripe => {
                self.child_for(address).set(address, data, insert, update).await
            }
            CompositeMode::Mirror => {
                let mut delta = 0;
                for child in &self.children {
                    delta = child.set(address, data.clone(), insert, update).await?;
                }
                Ok(delta)
            }
        }
    }

    async fn erase(&self, address: Address) -> SiloResult<()> {
        match self.mode {
            CompositeMode::Stripe => self.child_for(address).erase(address).await,
            CompositeMode::Mirror => {
                let mut found = false;
                for child in &self.children {
                    match child.erase(address).await {
                        Ok(()) => found = true,
                        Err(SiloError::MissingKey(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                if found {
                    Ok(())
                } else {
                    Err(SiloError::MissingKey(address))
                }
            }
        }
    }

    async fn list(&self) -> SiloResult<Vec<Address>> {
        let mut out = Vec::new();
        for child in &self.children {
            out.extend(child.list().await?);
        }
        out.sort();
        out.dedup();
        Ok(out)
    }

    async fn status(&self, address: Address) -> SiloResult<BlockStatus> {
        match self.mode {
            CompositeMode::Stripe => self.child_for(address).status(address).await,
            CompositeMode::Mirror => {
                for child in &self.children {
                    if child.status(address).await? == BlockStatus::Present {
                        return Ok(BlockStatus::Present);
                    }
                }
                Ok(BlockStatus::Missing)
            }
        }
    }

    async fn usage(&self) -> SiloResult<u64> {
        let mut total = 0;
        for child in &self.children {
            total += child.usage().await?;
        }
        Ok(total)
    }

    async fn capacity(&self) -> SiloResult<Option<u64>> {
        let mut total = 0u64;
        for child in &self.children {
            match child.capacity().await? {
                Some(c) => total = total.saturating_add(c),
                // One unbounded child makes the composite unbounded.
                None => return Ok(None),
            }
        }
        Ok(Some(total))
    }

    fn register_notifier(&self, notifier: Notifier) {
        for child in &self.children {
            child.register_notifier(notifier.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::silo::silo_tests::check_contract;
    use crate::silo::MemorySilo;

    #[tokio::test]
    async fn stripe_contract() {
        let silo = CompositeSilo::new(
            CompositeMode::Stripe,
            vec![
                Arc::new(MemorySilo::new(None)),
                Arc::new(MemorySilo::new(None)),
                Arc::new(MemorySilo::new(None)),
            ],
        )
        .unwrap();
        check_contract(&silo).await;
    }

    #[tokio::test]
    async fn mirror_replicates_to_all_children() {
        let a = Arc::new(MemorySilo::new(None));
        let b = Arc::new(MemorySilo::new(None));
        let silo =
            CompositeSilo::new(CompositeMode::Mirror, vec![a.clone(), b.clone()]).unwrap();

        let addr = Address::random();
        silo.set(addr, b"copy".to_vec(), true, false).await.unwrap();
        assert_eq!(a.get(addr).await.unwrap(), b"copy");
        assert_eq!(b.get(addr).await.unwrap(), b"copy");

        silo.erase(addr).await.unwrap();
        assert!(a.get(addr).await.is_err());
        assert!(b.get(addr).await.is_err());
    }

    #[tokio::test]
    async fn stripe_spreads_records() {
        let a = Arc::new(MemorySilo::new(None));
        let b = Arc::new(MemorySilo::new(None));
        let silo =
            CompositeSilo::new(CompositeMode::Stripe, vec![a.clone(), b.clone()]).unwrap();

        for _ in 0..32 {
            let addr = Address::random();
            silo.set(addr, b"r".to_vec(), true, false).await.unwrap();
        }
        let la = a.list().await.unwrap().len();
        let lb = b.list().await.unwrap().len();
        assert_eq!(la + lb, 32);
        assert!(la > 0 && lb > 0, "32 random addresses should hit both shards");
    }
}
