//! Audit trail of queue item outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

use offsync_common::{Error, ItemId, Result, StoreKey};
use offsync_storage::StorageBackend;

use crate::queue::{ItemKind, QueueItem};

/// What happened to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    Enqueued,
    Completed,
    Retried,
    Failed,
    Cleared,
    Imported,
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub item_id: ItemId,
    pub kind: ItemKind,
    pub event: AuditEvent,
    pub at: DateTime<Utc>,
    /// Error reason for `Retried`/`Failed`.
    #[serde(default)]
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn for_item(item: &QueueItem, event: AuditEvent) -> Self {
        let detail = match event {
            AuditEvent::Retried | AuditEvent::Failed => item.last_error.clone(),
            _ => None,
        };
        Self {
            item_id: item.id.clone(),
            kind: item.kind,
            event,
            at: Utc::now(),
            detail,
        }
    }
}

/// Bounded, persisted list of audit entries.
///
/// Entries are buffered in memory and written with [`flush`](Self::flush).
pub struct AuditLog {
    backend: Arc<dyn StorageBackend>,
    key: StoreKey,
    max_entries: usize,
    entries: Vec<AuditEntry>,
    dirty: bool,
}

impl AuditLog {
    /// Open the log stored under `key`.
    ///
    /// A corrupt log is discarded rather than blocking startup.
    pub async fn open(
        backend: Arc<dyn StorageBackend>,
        key: StoreKey,
        max_entries: usize,
    ) -> Result<Self> {
        let entries = match backend.read(&key).await? {
            Some(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                error!("Discarding unreadable audit log {}: {}", key, e);
                Vec::new()
            }),
            None => Vec::new(),
        };
        Ok(Self {
            backend,
            key,
            max_entries,
            entries,
            dirty: false,
        })
    }

    /// Append an entry, evicting the oldest beyond the cap.
    pub fn record(&mut self, entry: AuditEntry) {
        self.entries.push(entry);
        if self.entries.len() > self.max_entries {
            let excess = self.entries.len() - self.max_entries;
            self.entries.drain(..excess);
        }
        self.dirty = true;
    }

    /// Remove entries recorded before `cutoff`. Returns how many were removed.
    pub fn prune_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.at >= cutoff);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.dirty = true;
        }
        removed
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.dirty = true;
    }

    /// Write buffered changes, if any.
    pub async fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let data = serde_json::to_vec(&self.entries)?;
        self.backend.write(&self.key, data).await.map_err(|e| {
            error!("Failed to persist audit log {}: {}", self.key, e);
            Error::Persistence(format!("audit {}: {}", self.key, e))
        })?;
        self.dirty = false;
        debug!("Flushed {} audit entries", self.entries.len());
        Ok(())
    }

    /// Write every entry, even if nothing changed since the last flush.
    pub async fn rewrite(&mut self) -> Result<()> {
        self.dirty = true;
        self.flush().await
    }

    /// Reload from the backend, discarding unflushed entries.
    pub async fn reload(&mut self) -> Result<()> {
        let reopened = Self::open(self.backend.clone(), self.key.clone(), self.max_entries).await?;
        self.entries = reopened.entries;
        self.dirty = false;
        Ok(())
    }

    /// Entries for one item, oldest first.
    pub fn entries_for(&self, id: &ItemId) -> Vec<&AuditEntry> {
        self.entries.iter().filter(|e| &e.item_id == id).collect()
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }
}
