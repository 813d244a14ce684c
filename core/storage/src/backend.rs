//! Storage backend trait definition.

use async_trait::async_trait;

use offsync_common::{Result, StoreKey};

/// Key/value storage backend.
///
/// Values are opaque byte blobs written and read whole. Implementations
/// must make `write` atomic with respect to readers: a concurrent or
/// later `read` sees either the previous value or the new one, never a mix.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Get the backend name (e.g., "memory", "local").
    fn name(&self) -> &str;

    /// Read the value stored under `key`.
    ///
    /// # Returns
    /// `None` if the key has never been written or was deleted.
    async fn read(&self, key: &StoreKey) -> Result<Option<Vec<u8>>>;

    /// Replace the value stored under `key`.
    ///
    /// # Postconditions
    /// - A subsequent `read` returns `data`
    ///
    /// # Errors
    /// - I/O errors
    async fn write(&self, key: &StoreKey, data: Vec<u8>) -> Result<()>;

    /// Delete `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &StoreKey) -> Result<()>;

    /// List every stored key equal to or underneath `prefix`.
    async fn list(&self, prefix: &StoreKey) -> Result<Vec<StoreKey>>;

    /// Size in bytes of the value under `key`, if present.
    async fn size(&self, key: &StoreKey) -> Result<Option<u64>> {
        Ok(self.read(key).await?.map(|data| data.len() as u64))
    }
}
