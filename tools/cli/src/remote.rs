//! Directory-backed stand-in for the remote system.
//!
//! Each applied item is written to `<root>/<kind>/<id>.json`. Writing the
//! same item twice overwrites the same file, so redelivery is harmless.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use offsync_common::{Error, Result};
use offsync_sync::{ItemKind, ItemProcessor, ProcessorRegistry, QueueItem};

/// Payload flag that makes the processor report a failure.
const SIMULATE_FAILURE: &str = "simulate_failure";

pub struct DirectoryProcessor {
    root: PathBuf,
}

impl DirectoryProcessor {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn target(&self, item: &QueueItem) -> PathBuf {
        self.root
            .join(item.kind.as_str())
            .join(format!("{}.json", item.id))
    }
}

#[async_trait]
impl ItemProcessor for DirectoryProcessor {
    async fn process(&self, item: &QueueItem) -> Result<()> {
        if item.payload.get(SIMULATE_FAILURE).and_then(|v| v.as_bool()) == Some(true) {
            return Err(Error::Processor(format!(
                "Remote rejected item {} (simulated)",
                item.id
            )));
        }

        let target = self.target(item);
        let dir = target
            .parent()
            .ok_or_else(|| Error::InvalidInput(format!("No parent for {}", target.display())))?;
        tokio::fs::create_dir_all(dir).await?;

        let data = serde_json::to_vec_pretty(&item.payload)?;
        let temp = dir.join(format!(".{}.tmp", item.id));
        tokio::fs::write(&temp, data).await?;
        tokio::fs::rename(&temp, &target).await?;

        debug!("Applied {} to {}", item.id, target.display());
        Ok(())
    }
}

/// Registry with the directory processor for every item kind.
pub fn directory_processors(root: impl AsRef<Path>) -> Result<ProcessorRegistry> {
    let processor: Arc<dyn ItemProcessor> = Arc::new(DirectoryProcessor::new(root));
    let mut registry = ProcessorRegistry::new();
    for kind in ItemKind::ALL {
        registry.register(kind, processor.clone())?;
    }
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use offsync_sync::NewItem;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_process_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let processor = DirectoryProcessor::new(temp.path());
        let item = NewItem::new(ItemKind::RecordSubmit, json!({"name": "x"})).into_item(3);

        processor.process(&item).await.unwrap();
        processor.process(&item).await.unwrap();

        let dir = temp.path().join("record_submit");
        let files: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(files.len(), 1);

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.join(format!("{}.json", item.id))).unwrap())
                .unwrap();
        assert_eq!(written, json!({"name": "x"}));
    }

    #[tokio::test]
    async fn test_simulated_failure() {
        let temp = TempDir::new().unwrap();
        let registry = directory_processors(temp.path()).unwrap();
        let item = NewItem::new(ItemKind::AdminAction, json!({"simulate_failure": true})).into_item(1);

        let result = registry.resolve(ItemKind::AdminAction).unwrap().process(&item).await;
        assert!(matches!(result, Err(Error::Processor(_))));
        assert!(!temp.path().join("admin_action").exists());
    }
}
