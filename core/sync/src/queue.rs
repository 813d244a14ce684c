//! Durable queue of pending work items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, warn};

use offsync_common::{Error, ItemId, Result, StoreKey};
use offsync_storage::StorageBackend;

/// Processing priority of a queued item.
///
/// Ordered `Low < Medium < High`; higher priorities drain first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(Error::InvalidInput(format!("Unknown priority: {}", other))),
        }
    }
}

/// Kind of deferred work; selects the processor that applies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// A locally created record to submit to the remote store.
    RecordSubmit,
    /// An update to a user or staff profile.
    ProfileUpdate,
    /// An administrative action.
    AdminAction,
    /// Refresh all locally cached data from the remote side.
    FullResync,
}

impl ItemKind {
    pub const ALL: [ItemKind; 4] = [
        ItemKind::RecordSubmit,
        ItemKind::ProfileUpdate,
        ItemKind::AdminAction,
        ItemKind::FullResync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::RecordSubmit => "record_submit",
            ItemKind::ProfileUpdate => "profile_update",
            ItemKind::AdminAction => "admin_action",
            ItemKind::FullResync => "full_resync",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.to_ascii_lowercase().replace('-', "_");
        ItemKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown item kind: {}", s)))
    }
}

/// Lifecycle status of a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Waiting for a drain pass.
    Pending,
    /// Handed to its processor in the current pass.
    Processing,
    /// Applied successfully. Terminal.
    Completed,
    /// Retries exhausted or no processor available. Terminal.
    Failed,
}

impl ItemStatus {
    /// Completed and Failed never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }
}

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique, immutable identifier.
    pub id: ItemId,
    /// Which processor handles this item.
    pub kind: ItemKind,
    /// Processor-specific data. The engine never inspects it.
    pub payload: serde_json::Value,
    /// Enqueue time; secondary drain order key.
    pub created_at: DateTime<Utc>,
    /// Time of the last status transition.
    pub updated_at: DateTime<Utc>,
    /// Failed processing attempts so far.
    pub retry_count: u32,
    /// Failed attempts after which the item becomes Failed.
    pub max_retries: u32,
    pub priority: Priority,
    pub status: ItemStatus,
    /// Reason of the most recent failure.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Earliest time the next attempt may run, when backoff is enabled.
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    /// Mark as handed to its processor.
    pub fn mark_processing(&mut self) {
        self.status = ItemStatus::Processing;
        self.updated_at = Utc::now();
    }

    /// Mark as applied successfully.
    pub fn mark_completed(&mut self) {
        self.status = ItemStatus::Completed;
        self.last_error = None;
        self.next_attempt_at = None;
        self.updated_at = Utc::now();
    }

    /// Record a failed attempt.
    ///
    /// Returns the resulting status: `Failed` once `retry_count` reaches
    /// `max_retries`, otherwise `Pending` gated by `next_attempt_at`.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        next_attempt_at: Option<DateTime<Utc>>,
    ) -> ItemStatus {
        self.retry_count += 1;
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
        if self.retry_count >= self.max_retries {
            self.status = ItemStatus::Failed;
            self.next_attempt_at = None;
        } else {
            self.status = ItemStatus::Pending;
            self.next_attempt_at = next_attempt_at;
        }
        self.status
    }

    /// Mark as terminally failed without consuming a retry.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = ItemStatus::Failed;
        self.last_error = Some(error.into());
        self.next_attempt_at = None;
        self.updated_at = Utc::now();
    }

    /// Whether this item should be attempted in a pass running at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ItemStatus::Pending && self.next_attempt_at.map_or(true, |at| at <= now)
    }
}

/// Drain order: priority descending, then oldest first.
pub fn drain_order(a: &QueueItem, b: &QueueItem) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
}

/// Request to enqueue a new item.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub id: Option<ItemId>,
    pub kind: ItemKind,
    pub payload: serde_json::Value,
    pub priority: Priority,
    /// Falls back to the engine's configured default when unset.
    pub max_retries: Option<u32>,
}

impl NewItem {
    /// Create a medium-priority request with the default retry budget.
    pub fn new(kind: ItemKind, payload: serde_json::Value) -> Self {
        Self {
            id: None,
            kind,
            payload,
            priority: Priority::default(),
            max_retries: None,
        }
    }

    /// Use a caller-chosen id instead of a generated one.
    pub fn with_id(mut self, id: ItemId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Build the queue item, filling in id, timestamps and initial status.
    pub fn into_item(self, default_max_retries: u32) -> QueueItem {
        let now = Utc::now();
        QueueItem {
            id: self.id.unwrap_or_else(ItemId::generate),
            kind: self.kind,
            payload: self.payload,
            created_at: now,
            updated_at: now,
            retry_count: 0,
            max_retries: self.max_retries.unwrap_or(default_max_retries),
            priority: self.priority,
            status: ItemStatus::Pending,
            last_error: None,
            next_attempt_at: None,
        }
    }
}

/// Durable, ordered collection of queue items.
///
/// The in-memory list is authoritative; every mutation rewrites the whole
/// collection under a single key. If a write fails the memory copy is kept
/// and the next successful write catches the backend up.
pub struct QueueStore {
    backend: Arc<dyn StorageBackend>,
    key: StoreKey,
    items: Vec<QueueItem>,
}

impl QueueStore {
    /// Open the queue stored under `key`, loading any persisted items.
    ///
    /// # Errors
    /// - Backend read failure
    /// - Persisted data is not a valid queue
    pub async fn open(backend: Arc<dyn StorageBackend>, key: StoreKey) -> Result<Self> {
        let mut store = Self {
            backend,
            key,
            items: Vec::new(),
        };
        store.items = store.load_all().await?;
        debug!("Opened queue {} with {} items", store.key, store.items.len());
        Ok(store)
    }

    /// Read the persisted collection.
    ///
    /// Items left `Processing` by an interrupted pass come back as `Pending`.
    /// Duplicate ids keep their first occurrence.
    pub async fn load_all(&self) -> Result<Vec<QueueItem>> {
        let Some(data) = self.backend.read(&self.key).await? else {
            return Ok(Vec::new());
        };
        let persisted: Vec<QueueItem> = serde_json::from_slice(&data)?;
        Ok(normalize(persisted))
    }

    /// Append a new item and persist before returning.
    ///
    /// The item is forced to `Pending` with a zero retry count.
    ///
    /// # Errors
    /// - `AlreadyExists` if the id is already queued
    /// - `Persistence` if the write failed; the item stays queued in memory
    pub async fn append(&mut self, mut item: QueueItem) -> Result<ItemId> {
        if self.get(&item.id).is_some() {
            return Err(Error::AlreadyExists(format!("Queue item {}", item.id)));
        }

        item.status = ItemStatus::Pending;
        item.retry_count = 0;
        item.next_attempt_at = None;
        let id = item.id.clone();
        self.items.push(item);

        self.persist().await?;
        Ok(id)
    }

    /// Replace the whole collection and persist it.
    pub async fn replace_all(&mut self, items: Vec<QueueItem>) -> Result<()> {
        self.items = items;
        self.persist().await
    }

    /// Remove items by id and persist. Returns how many were removed.
    pub async fn remove(&mut self, ids: &[ItemId]) -> Result<usize> {
        let ids: HashSet<&ItemId> = ids.iter().collect();
        let before = self.items.len();
        self.items.retain(|item| !ids.contains(&item.id));
        let removed = before - self.items.len();
        if removed > 0 {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Drop every item and persist the empty collection.
    pub async fn clear(&mut self) -> Result<Vec<QueueItem>> {
        let cleared = std::mem::take(&mut self.items);
        self.persist().await?;
        Ok(cleared)
    }

    /// Remove `Completed` items from memory, returning them.
    ///
    /// Does not persist; callers write back once per pass.
    pub fn take_completed(&mut self) -> Vec<QueueItem> {
        let (completed, remaining) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|item| item.status == ItemStatus::Completed);
        self.items = remaining;
        completed
    }

    /// Remove in-memory items matching `predicate`, returning them.
    pub fn take_where(&mut self, predicate: impl Fn(&QueueItem) -> bool) -> Vec<QueueItem> {
        let (taken, remaining) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|item| predicate(item));
        self.items = remaining;
        taken
    }

    /// Write the in-memory collection to the backend.
    pub async fn persist(&self) -> Result<()> {
        let data = serde_json::to_vec(&self.items)?;
        self.backend.write(&self.key, data).await.map_err(|e| {
            error!("Failed to persist queue {}: {}", self.key, e);
            Error::Persistence(format!("queue {}: {}", self.key, e))
        })
    }

    /// Pending items due at `now`, in drain order.
    pub fn due_items(&self, now: DateTime<Utc>) -> Vec<QueueItem> {
        let mut due: Vec<QueueItem> = self
            .items
            .iter()
            .filter(|item| item.is_due(now))
            .cloned()
            .collect();
        due.sort_by(drain_order);
        due
    }

    /// Get an item by id.
    pub fn get(&self, id: &ItemId) -> Option<&QueueItem> {
        self.items.iter().find(|item| &item.id == id)
    }

    /// Get a mutable item by id.
    pub fn get_mut(&mut self, id: &ItemId) -> Option<&mut QueueItem> {
        self.items.iter_mut().find(|item| &item.id == id)
    }

    /// All items in insertion order.
    pub fn items(&self) -> &[QueueItem] {
        &self.items
    }

    /// Count of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn normalize(items: Vec<QueueItem>) -> Vec<QueueItem> {
    let mut seen = HashSet::new();
    let mut result = Vec::with_capacity(items.len());
    for mut item in items {
        if !seen.insert(item.id.clone()) {
            warn!("Dropping duplicate queue item {}", item.id);
            continue;
        }
        if item.status == ItemStatus::Processing {
            item.status = ItemStatus::Pending;
        }
        result.push(item);
    }
    result
}
