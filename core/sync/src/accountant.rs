//! Storage usage reporting and retention pruning.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use offsync_common::{Result, StoreKey};
use offsync_storage::StorageBackend;

use crate::audit::AuditLog;
use crate::queue::{ItemStatus, QueueStore};

/// Bytes used under the engine's namespace against the configured quota.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StorageUsage {
    pub used: u64,
    pub available: u64,
    /// `used / quota * 100`; may exceed 100 when over quota.
    pub percentage: f64,
}

/// What a prune removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub items_removed: usize,
    pub audit_entries_removed: usize,
}

/// Measures persisted state and removes old terminal data.
pub struct StorageAccountant {
    backend: Arc<dyn StorageBackend>,
    namespace: StoreKey,
    quota_bytes: u64,
}

impl StorageAccountant {
    pub fn new(backend: Arc<dyn StorageBackend>, namespace: StoreKey, quota_bytes: u64) -> Self {
        Self {
            backend,
            namespace,
            quota_bytes,
        }
    }

    /// Sum the sizes of every key under the namespace.
    ///
    /// Reads the backend directly, so the figure reflects what is durable,
    /// not unflushed memory.
    pub async fn usage(&self) -> Result<StorageUsage> {
        let mut used = 0u64;
        for key in self.backend.list(&self.namespace).await? {
            used += self.backend.size(&key).await?.unwrap_or(0);
        }

        let percentage = if self.quota_bytes == 0 {
            if used == 0 { 0.0 } else { 100.0 }
        } else {
            used as f64 / self.quota_bytes as f64 * 100.0
        };

        debug!("Storage usage under {}: {} bytes", self.namespace, used);
        Ok(StorageUsage {
            used,
            available: self.quota_bytes.saturating_sub(used),
            percentage,
        })
    }

    /// Remove Completed and Failed items last updated before `cutoff`, and
    /// audit entries recorded before it.
    ///
    /// Pending and Processing items are never removed.
    ///
    /// # Errors
    /// - Persisting the pruned queue or audit log failed
    pub async fn prune(
        &self,
        queue: &mut QueueStore,
        audit: &mut AuditLog,
        cutoff: DateTime<Utc>,
    ) -> Result<PruneReport> {
        let pruned = queue.take_where(|item| {
            matches!(item.status, ItemStatus::Completed | ItemStatus::Failed)
                && item.updated_at < cutoff
        });
        if !pruned.is_empty() {
            queue.persist().await?;
        }

        let audit_entries_removed = audit.prune_before(cutoff);
        audit.flush().await?;

        let report = PruneReport {
            items_removed: pruned.len(),
            audit_entries_removed,
        };
        info!(
            "Pruned {} items and {} audit entries older than {}",
            report.items_removed, report.audit_entries_removed, cutoff
        );
        Ok(report)
    }
}
