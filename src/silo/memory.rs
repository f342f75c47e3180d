//! In-memory silo for tests, caches and throwaway clusters.

use super::{BlockStatus, Notifier, Silo, SiloError, SiloResult};
use crate::address::Address;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    records: HashMap<Address, Vec<u8>>,
    usage: u64,
    notifier: Option<Notifier>,
}

pub struct MemorySilo {
    inner: Mutex<Inner>,
    capacity: Option<u64>,
}

impl MemorySilo {
    pub fn new(capacity: Option<u64>) -> Self {
        Self { inner: Mutex::new(Inner::default()), capacity }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory silo poisoned")
    }
}

#[async_trait]
impl Silo for MemorySilo {
    async fn get(&self, address: Address) -> SiloResult<Vec<u8>> {
        self.lock()
            .records
            .get(&address)
            .cloned()
            .ok_or(SiloError::MissingKey(address))
    }

    async fn set(
        &self,
        address: Address,
        data: Vec<u8>,
        insert: bool,
        update: bool,
    ) -> SiloResult<i64> {
        let (delta, notifier) = {
            let mut inner = self.lock();
            let existing = inner.records.get(&address).map(|d| d.len() as i64);
            if insert && existing.is_some() {
                return Err(SiloError::Collision(address));
            }
            if update && existing.is_none() {
                return Err(SiloError::MissingKey(address));
            }
            let delta = data.len() as i64 - existing.unwrap_or(0);
            if let Some(capacity) = self.capacity {
                let projected = inner.usage.saturating_add_signed(delta);
                if projected > capacity {
                    return Err(SiloError::Capacity { usage: inner.usage, capacity });
                }
            }
            inner.records.insert(address, data);
            inner.usage = inner.usage.saturating_add_signed(delta);
            (delta, inner.notifier.clone())
        };
        if let Some(notify) = notifier {
            notify(address, delta);
        }
        Ok(delta)
    }

    async fn erase(&self, address: Address) -> SiloResult<()> {
        let (delta, notifier) = {
            let mut inner = self.lock();
            let data = inner
                .records
                .remove(&address)
                .ok_or(SiloError::MissingKey(address))?;
            let delta = -(data.len() as i64);
            inner.usage = inner.usage.saturating_add_signed(delta);
            (delta, inner.notifier.clone())
        };
        if let Some(notify) = notifier {
            notify(address, delta);
        }
        Ok(())
    }

    async fn list(&self) -> SiloResult<Vec<Address>> {
        Ok(self.lock().records.keys().copied().collect())
    }

    async fn status(&self, address: Address) -> SiloResult<BlockStatus> {
        Ok(if self.lock().records.contains_key(&address) {
            BlockStatus::Present
        } else {
            BlockStatus::Missing
        })
    }

    async fn usage(&self) -> SiloResult<u64> {
        Ok(self.lock().usage)
    }

    async fn capacity(&self) -> SiloResult<Option<u64>> {
        Ok(self.capacity)
    }

    fn register_notifier(&self, notifier: Notifier) {
        self.lock().notifier = Some(notifier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::silo::silo_tests::check_contract;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn contract() {
        check_contract(&MemorySilo::new(None)).await;
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let silo = MemorySilo::new(Some(8));
        let a = Address::random();
        silo.set(a, vec![0; 8], true, false).await.unwrap();
        let b = Address::random();
        assert!(matches!(
            silo.set(b, vec![0; 1], true, false).await,
            Err(SiloError::Capacity { .. })
        ));
    }

    #[tokio::test]
    async fn notifier_sees_deltas() {
        let silo = MemorySilo::new(None);
        let total = Arc::new(AtomicI64::new(0));
        let seen = total.clone();
        silo.register_notifier(Arc::new(move |_, delta| {
            seen.fetch_add(delta, Ordering::SeqCst);
        }));

        let a = Address::random();
        silo.set(a, vec![0; 10], true, false).await.unwrap();
        silo.set(a, vec![0; 4], false, true).await.unwrap();
        silo.erase(a).await.unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 0);
    }
}
