//! In-memory storage backend for testing.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use offsync_common::{Error, Result, StoreKey};
use crate::backend::StorageBackend;

/// In-memory storage backend.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop. Clones share the same underlying map, so a test can
/// keep a handle and inspect what the engine persisted.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    storage: Arc<RwLock<BTreeMap<StoreKey, Vec<u8>>>>,
    /// Writes and deletes still allowed; `None` means unlimited.
    write_budget: Arc<Mutex<Option<usize>>>,
}

impl MemoryBackend {
    /// Create a new empty memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `write` and `delete` fail with a storage error.
    ///
    /// Used to exercise infrastructure-failure paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.set_write_budget(if fail { Some(0) } else { None });
    }

    /// Allow `writes` more writes or deletes, then fail like
    /// [`set_fail_writes(true)`](Self::set_fail_writes).
    pub fn fail_writes_after(&self, writes: usize) {
        self.set_write_budget(Some(writes));
    }

    fn set_write_budget(&self, budget: Option<usize>) {
        *self
            .write_budget
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = budget;
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.storage.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Check if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_writable(&self) -> Result<()> {
        let mut budget = self
            .write_budget
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match budget.as_mut() {
            None => Ok(()),
            Some(0) => Err(Error::Storage("Memory backend writes disabled".to_string())),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
        }
    }
}

fn poisoned() -> Error {
    Error::Storage("Memory backend lock poisoned".to_string())
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn read(&self, key: &StoreKey) -> Result<Option<Vec<u8>>> {
        let storage = self.storage.read().map_err(|_| poisoned())?;
        Ok(storage.get(key).cloned())
    }

    async fn write(&self, key: &StoreKey, data: Vec<u8>) -> Result<()> {
        self.check_writable()?;
        let mut storage = self.storage.write().map_err(|_| poisoned())?;
        storage.insert(key.clone(), data);
        Ok(())
    }

    async fn delete(&self, key: &StoreKey) -> Result<()> {
        self.check_writable()?;
        let mut storage = self.storage.write().map_err(|_| poisoned())?;
        storage.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &StoreKey) -> Result<Vec<StoreKey>> {
        let storage = self.storage.read().map_err(|_| poisoned())?;
        Ok(storage
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn size(&self, key: &StoreKey) -> Result<Option<u64>> {
        let storage = self.storage.read().map_err(|_| poisoned())?;
        Ok(storage.get(key).map(|data| data.len() as u64))
    }
}
