//! Sled-backed silo: a single tree keyed by address bytes.

use super::{BlockStatus, Notifier, Silo, SiloError, SiloResult};
use crate::address::Address;
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub struct SledSilo {
    db: sled::Db,
    capacity: Option<u64>,
    usage: AtomicU64,
    notifier: Mutex<Option<Notifier>>,
}

impl SledSilo {
    pub fn open(path: impl AsRef<Path>, capacity: Option<u64>) -> SiloResult<Self> {
        let db = sled::open(path).map_err(SiloError::backend)?;
        let mut usage = 0u64;
        for item in db.iter() {
            let (_, value) = item.map_err(SiloError::backend)?;
            usage += value.len() as u64;
        }
        Ok(Self { db, capacity, usage: AtomicU64::new(usage), notifier: Mutex::new(None) })
    }

    fn notify(&self, address: Address, delta: i64) {
        let notifier = self.notifier.lock().expect("notifier poisoned").clone();
        if let Some(notify) = notifier {
            notify(address, delta);
        }
    }
}

#[async_trait]
impl Silo for SledSilo {
    async fn get(&self, address: Address) -> SiloResult<Vec<u8>> {
        self.db
            .get(address.0)
            .map_err(SiloError::backend)?
            .map(|v| v.to_vec())
            .ok_or(SiloError::MissingKey(address))
    }

    async fn set(
        &self,
        address: Address,
        data: Vec<u8>,
        insert: bool,
        update: bool,
    ) -> SiloResult<i64> {
        let existing = self
            .db
            .get(address.0)
            .map_err(SiloError::backend)?
            .map(|v| v.len() as i64);
        if insert && existing.is_some() {
            return Err(SiloError::Collision(address));
        }
        if update && existing.is_none() {
            return Err(SiloError::MissingKey(address));
        }
        let delta = data.len() as i64 - existing.unwrap_or(0);
        if let Some(capacity) = self.capacity {
            let usage = self.usage.load(Ordering::SeqCst);
            if usage.saturating_add_signed(delta) > capacity {
                return Err(SiloError::Capacity { usage, capacity });
            }
        }
        self.db.insert(address.0, data).map_err(SiloError::backend)?;
        self.db.flush_async().await.map_err(SiloError::backend)?;
        if delta >= 0 {
            self.usage.fetch_add(delta as u64, Ordering::SeqCst);
        } else {
            self.usage.fetch_sub((-delta) as u64, Ordering::SeqCst);
        }
        self.notify(address, delta);
        Ok(delta)
    }

    async fn erase(&self, address: Address) -> SiloResult<()> {
        let removed = self
            .db
            .remove(address.0)
            .map_err(SiloError::backend)?
            .ok_or(SiloError::MissingKey(address))?;
        self.db.flush_async().await.map_err(SiloError::backend)?;
        self.usage.fetch_sub(removed.len() as u64, Ordering::SeqCst);
        self.notify(address, -(removed.len() as i64));
        Ok(())
    }

    async fn list(&self) -> SiloResult<Vec<Address>> {
        let mut out = Vec::new();
        for item in self.db.iter() {
            let (key, _) = item.map_err(SiloError::backend)?;
            if let Ok(bytes) = <[u8; 32]>::try_from(key.as_ref()) {
                out.push(Address(bytes));
            }
        }
        Ok(out)
    }

    async fn status(&self, address: Address) -> SiloResult<BlockStatus> {
        let present = self.db.contains_key(address.0).map_err(SiloError::backend)?;
        Ok(if present { BlockStatus::Present } else { BlockStatus::Missing })
    }

    async fn usage(&self) -> SiloResult<u64> {
        Ok(self.usage.load(Ordering::SeqCst))
    }

    async fn capacity(&self) -> SiloResult<Option<u64>> {
        Ok(self.capacity)
    }

    fn register_notifier(&self, notifier: Notifier) {
        *self.notifier.lock().expect("notifier poisoned") = Some(notifier);
    }
}
