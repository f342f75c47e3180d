//! Directory silo: one file per address, atomic replace via rename.

use super::{BlockStatus, Notifier, Silo, SiloError, SiloResult};
use crate::address::Address;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;

pub struct DirectorySilo {
    root: PathBuf,
    capacity: Option<u64>,
    /// Byte total, seeded by a walk at open and maintained on mutation.
    usage: AtomicU64,
    notifier: Mutex<Option<Notifier>>,
}

impl DirectorySilo {
    pub fn open(root: impl AsRef<Path>, capacity: Option<u64>) -> SiloResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(SiloError::backend)?;

        let mut usage = 0u64;
        for entry in std::fs::read_dir(&root).map_err(SiloError::backend)? {
            let entry = entry.map_err(SiloError::backend)?;
            if entry.path().extension().is_some() {
                // Leftover temp file from an interrupted write.
                let _ = std::fs::remove_file(entry.path());
                continue;
            }
            usage += entry.metadata().map_err(SiloError::backend)?.len();
        }
        debug!(root = %root.display(), usage, "opened directory silo");
        Ok(Self { root, capacity, usage: AtomicU64::new(usage), notifier: Mutex::new(None) })
    }

    fn path_of(&self, address: Address) -> PathBuf {
        self.root.join(address.to_string())
    }

    fn notify(&self, address: Address, delta: i64) {
        let notifier = self.notifier.lock().expect("notifier poisoned").clone();
        if let Some(notify) = notifier {
            notify(address, delta);
        }
    }
}

#[async_trait]
impl Silo for DirectorySilo {
    async fn get(&self, address: Address) -> SiloResult<Vec<u8>> {
        match tokio::fs::read(self.path_of(address)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SiloError::MissingKey(address))
            }
            Err(e) => Err(SiloError::backend(e)),
        }
    }

    async fn set(
        &self,
        address: Address,
        data: Vec<u8>,
        insert: bool,
        update: bool,
    ) -> SiloResult<i64> {
        let path = self.path_of(address);
        let existing = match tokio::fs::metadata(&path).await {
            Ok(meta) => Some(meta.len() as i64),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(SiloError::backend(e)),
        };
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

        // Write to a temp name, then rename: readers never observe a
        // half-written record.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &data).await.map_err(SiloError::backend)?;
        tokio::fs::rename(&tmp, &path).await.map_err(SiloError::backend)?;

        if delta >= 0 {
            self.usage.fetch_add(delta as u64, Ordering::SeqCst);
        } else {
            self.usage.fetch_sub((-delta) as u64, Ordering::SeqCst);
        }
        self.notify(address, delta);
        Ok(delta)
    }

    async fn erase(&self, address: Address) -> SiloResult<()> {
        let path = self.path_of(address);
        let len = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SiloError::MissingKey(address))
            }
            Err(e) => return Err(SiloError::backend(e)),
        };
        tokio::fs::remove_file(&path).await.map_err(SiloError::backend)?;
        self.usage.fetch_sub(len, Ordering::SeqCst);
        self.notify(address, -(len as i64));
        Ok(())
    }

    async fn list(&self) -> SiloResult<Vec<Address>> {
        let mut out = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await.map_err(SiloError::backend)?;
        while let Some(entry) = dir.next_entry().await.map_err(SiloError::backend)? {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(address) = name.parse::<Address>() {
                    out.push(address);
                }
            }
        }
        Ok(out)
    }

    async fn status(&self, address: Address) -> SiloResult<BlockStatus> {
        match tokio::fs::metadata(self.path_of(address)).await {
            Ok(_) => Ok(BlockStatus::Present),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BlockStatus::Missing),
            Err(e) => Err(SiloError::backend(e)),
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::silo::silo_tests::check_contract;

    #[tokio::test]
    async fn contract() {
        let dir = tempfile::tempdir().unwrap();
        let silo = DirectorySilo::open(dir.path(), None).unwrap();
        check_contract(&silo).await;
    }

    #[tokio::test]
    async fn usage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let addr = Address::random();
        {
            let silo = DirectorySilo::open(dir.path(), None).unwrap();
            silo.set(addr, vec![7; 100], true, false).await.unwrap();
        }
        let reopened = DirectorySilo::open(dir.path(), None).unwrap();
        assert_eq!(reopened.usage().await.unwrap(), 100);
        assert_eq!(reopened.get(addr).await.unwrap(), vec![7; 100]);
        assert_eq!(reopened.list().await.unwrap(), vec![addr]);
    }
}
