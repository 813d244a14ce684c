//! Local filesystem storage backend.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::backend::StorageBackend;
use offsync_common::{Error, Result, StoreKey};

/// File extension for stored values.
const VALUE_EXT: &str = "val";

/// Local filesystem storage backend.
///
/// Each key maps to one file: `a/b/c` is stored at `<root>/a/b/c.val`.
/// Writes go to a temporary sibling file that is renamed over the target,
/// so a crash mid-write leaves the previous value intact.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a new local backend with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of this backend.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory that holds keys nested under `key`.
    fn to_dir_path(&self, key: &StoreKey) -> PathBuf {
        let mut path = self.root.clone();
        for component in key.components() {
            path.push(component);
        }
        path
    }

    /// File holding the value of `key`.
    fn to_file_path(&self, key: &StoreKey) -> PathBuf {
        let mut path = self.to_dir_path(key);
        path.set_file_name(format!("{}.{}", key.name(), VALUE_EXT));
        path
    }

    /// Rebuild a key from a value file path below `root`.
    fn key_from_file(&self, file: &Path) -> Option<StoreKey> {
        let relative = file.strip_prefix(&self.root).ok()?;
        let mut components: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let last = components.pop()?;
        let name = last.strip_suffix(&format!(".{}", VALUE_EXT))?;
        if name.starts_with('.') {
            return None;
        }
        components.push(name.to_string());
        StoreKey::from_components(components).ok()
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn read(&self, key: &StoreKey) -> Result<Option<Vec<u8>>> {
        match fs::read(self.to_file_path(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn write(&self, key: &StoreKey, data: Vec<u8>) -> Result<()> {
        let target = self.to_file_path(key);
        let parent = target
            .parent()
            .ok_or_else(|| Error::InvalidInput(format!("Key has no parent directory: {}", key)))?;
        fs::create_dir_all(parent).await?;

        let temp = parent.join(format!(".{}.{}.tmp", key.name(), Uuid::new_v4()));
        fs::write(&temp, &data).await?;
        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(Error::Io(e));
        }

        debug!("Wrote {} bytes to {}", data.len(), key);
        Ok(())
    }

    async fn delete(&self, key: &StoreKey) -> Result<()> {
        match fs::remove_file(self.to_file_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn list(&self, prefix: &StoreKey) -> Result<Vec<StoreKey>> {
        let mut results = Vec::new();

        if fs::try_exists(self.to_file_path(prefix)).await? {
            results.push(prefix.clone());
        }

        let mut pending = vec![self.to_dir_path(prefix)];
        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::Io(e)),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Some(key) = self.key_from_file(&path) {
                    results.push(key);
                }
            }
        }

        results.sort();
        Ok(results)
    }

    async fn size(&self, key: &StoreKey) -> Result<Option<u64>> {
        match fs::metadata(self.to_file_path(key)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(s: &str) -> StoreKey {
        StoreKey::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_local_write_read() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path()).unwrap();
        let data = b"Hello, Local!".to_vec();

        backend.write(&key("offsync/queue"), data.clone()).await.unwrap();
        let read = backend.read(&key("offsync/queue")).await.unwrap();

        assert_eq!(read, Some(data));
        assert!(temp.path().join("offsync").join("queue.val").exists());
    }

    #[tokio::test]
    async fn test_local_overwrite_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path()).unwrap();

        backend.write(&key("ns/a"), vec![1]).await.unwrap();
        backend.write(&key("ns/a"), vec![2, 2]).await.unwrap();

        assert_eq!(backend.read(&key("ns/a")).await.unwrap(), Some(vec![2, 2]));
        let files: Vec<_> = std::fs::read_dir(temp.path().join("ns")).unwrap().collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn test_local_missing_key() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path()).unwrap();

        assert_eq!(backend.read(&key("ns/none")).await.unwrap(), None);
        assert_eq!(backend.size(&key("ns/none")).await.unwrap(), None);
        backend.delete(&key("ns/none")).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_list() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path()).unwrap();

        backend.write(&key("ns"), vec![0]).await.unwrap();
        backend.write(&key("ns/queue"), vec![1]).await.unwrap();
        backend.write(&key("ns/deep/audit"), vec![2]).await.unwrap();
        backend.write(&key("other/queue"), vec![3]).await.unwrap();

        let keys = backend.list(&key("ns")).await.unwrap();
        assert_eq!(keys, vec![key("ns"), key("ns/deep/audit"), key("ns/queue")]);
    }

    #[tokio::test]
    async fn test_local_size_and_delete() {
        let temp = TempDir::new().unwrap();
        let backend = LocalBackend::new(temp.path()).unwrap();

        backend.write(&key("ns/a"), vec![7; 10]).await.unwrap();
        assert_eq!(backend.size(&key("ns/a")).await.unwrap(), Some(10));

        backend.delete(&key("ns/a")).await.unwrap();
        assert!(backend.list(&key("ns")).await.unwrap().is_empty());
    }
}
