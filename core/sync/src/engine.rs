//! Core sync engine that drains the queue and coordinates all state.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use offsync_common::{Error, ItemId, Result, StoreKey};
use offsync_storage::StorageBackend;

use crate::accountant::{PruneReport, StorageAccountant, StorageUsage};
use crate::audit::{AuditEntry, AuditEvent, AuditLog};
use crate::config::SyncConfig;
use crate::export::ExportBundle;
use crate::network::NetworkMonitor;
use crate::processor::ProcessorRegistry;
use crate::queue::{ItemKind, ItemStatus, NewItem, QueueItem, QueueStore};
use crate::retry::RetryExecutor;
use crate::scheduler::SyncWorker;
use crate::state::{StatePublisher, Subscription, SyncState};

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncSummary {
    /// Items applied successfully.
    pub processed: usize,
    /// Failed attempts, including ones that will be retried.
    pub failed: usize,
    /// Items that became terminally Failed in this pass.
    pub exhausted: usize,
    /// Reasons for every failure, plus write-back errors.
    pub errors: Vec<String>,
    /// The pass did not run (already running, offline, or shut down).
    pub skipped: bool,
    pub duration: Duration,
}

impl SyncSummary {
    fn skipped(started: Instant) -> Self {
        Self {
            skipped: true,
            duration: started.elapsed(),
            ..Self::default()
        }
    }
}

/// Persisted engine metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SyncMeta {
    last_sync_time: Option<DateTime<Utc>>,
    data_version: u64,
}

enum Outcome {
    Applied,
    Failed(String),
    /// No processor for the kind; a configuration error.
    Unroutable(String),
}

struct Inner {
    config: SyncConfig,
    backend: Arc<dyn StorageBackend>,
    monitor: Arc<dyn NetworkMonitor>,
    processors: ProcessorRegistry,
    namespace: StoreKey,
    meta_key: StoreKey,
    /// Lock order: `pass_guard`, then `queue`, then `audit`.
    pass_guard: Mutex<()>,
    queue: Mutex<QueueStore>,
    audit: Mutex<AuditLog>,
    publisher: StatePublisher,
    accountant: StorageAccountant,
    write_back: RetryExecutor,
    trigger: Arc<Notify>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Offline-first sync engine.
///
/// Cloning is cheap; clones share the same queue, state and worker.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

/// Handle that does not keep the engine alive.
#[derive(Clone)]
pub(crate) struct WeakSyncEngine {
    inner: Weak<Inner>,
}

impl WeakSyncEngine {
    pub(crate) fn upgrade(&self) -> Option<SyncEngine> {
        self.inner.upgrade().map(|inner| SyncEngine { inner })
    }
}

impl SyncEngine {
    /// Open the engine over `backend`, loading persisted queue and metadata.
    ///
    /// `processors` must already hold every kind the application enqueues;
    /// items of unregistered kinds fail on their first pass. The network
    /// monitor is asked once for the initial state; if it cannot answer the
    /// engine assumes it is online.
    ///
    /// # Errors
    /// - Invalid configuration
    /// - Backend read failure, or a persisted queue that cannot be parsed
    pub async fn open(
        backend: Arc<dyn StorageBackend>,
        monitor: Arc<dyn NetworkMonitor>,
        processors: ProcessorRegistry,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        let namespace = config.namespace_key()?;
        let meta_key = config.meta_key()?;

        let queue = QueueStore::open(backend.clone(), config.queue_key()?).await?;
        let audit = AuditLog::open(backend.clone(), config.audit_key()?, config.max_audit_entries).await?;
        let meta = load_meta(backend.as_ref(), &meta_key).await?;

        let online = match monitor.is_online().await {
            Ok(online) => online,
            Err(e) => {
                warn!("Network monitor unavailable, assuming online: {}", e);
                true
            }
        };

        let publisher = StatePublisher::new(SyncState {
            online,
            queued_items: visible_items(&queue),
            sync_in_progress: false,
            last_sync_time: meta.last_sync_time,
            data_version: meta.data_version,
        });
        let accountant =
            StorageAccountant::new(backend.clone(), namespace.clone(), config.storage_quota_bytes);
        let write_back = RetryExecutor::new(config.retry.clone(), config.persist_retries);

        info!(
            "Sync engine opened on '{}' backend: {} queued items, {}",
            backend.name(),
            queue.len(),
            if online { "online" } else { "offline" }
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                backend,
                monitor,
                processors,
                namespace,
                meta_key,
                pass_guard: Mutex::new(()),
                queue: Mutex::new(queue),
                audit: Mutex::new(audit),
                publisher,
                accountant,
                write_back,
                trigger: Arc::new(Notify::new()),
                cancel: CancellationToken::new(),
                shut_down: AtomicBool::new(false),
                worker: std::sync::Mutex::new(None),
            }),
        })
    }

    /// Start the background worker.
    ///
    /// The worker drains on explicit triggers, on the periodic timer, and
    /// after the connection settles following an offline to online
    /// transition. Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// - `AlreadyExists` if the worker is running
    /// - `Shutdown` after [`shutdown`](Self::shutdown)
    pub fn start(&self) -> Result<()> {
        self.ensure_running()?;
        let mut slot = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return Err(Error::AlreadyExists("Sync worker is already running".to_string()));
        }

        let worker = SyncWorker::new(
            WeakSyncEngine {
                inner: Arc::downgrade(&self.inner),
            },
            self.inner.trigger.clone(),
            self.inner.cancel.clone(),
            self.inner.monitor.subscribe(),
            &self.inner.config,
        );
        *slot = Some(tokio::spawn(worker.run()));

        let state = self.inner.publisher.snapshot();
        if state.online && state.has_pending_work() {
            self.inner.trigger.notify_one();
        }
        Ok(())
    }

    /// Queue a unit of work and persist it before returning.
    ///
    /// If the engine is online the worker is nudged to drain; the call
    /// never waits for processing.
    ///
    /// # Errors
    /// - `Shutdown` after [`shutdown`](Self::shutdown)
    /// - `AlreadyExists` if the requested id is already queued
    /// - `Persistence` if the durable write failed; the item remains queued
    ///   in memory and is written with the next successful persist
    pub async fn enqueue(&self, request: NewItem) -> Result<ItemId> {
        self.ensure_running()?;
        let item = request.into_item(self.inner.config.default_max_retries);
        let id = item.id.clone();
        let kind = item.kind;

        let appended = {
            let mut queue = self.inner.queue.lock().await;
            let appended = queue.append(item).await;
            if !matches!(appended, Err(Error::AlreadyExists(_))) {
                self.publish_queue(&queue);
                if let Some(stored) = queue.get(&id) {
                    let entry = AuditEntry::for_item(stored, AuditEvent::Enqueued);
                    let mut audit = self.inner.audit.lock().await;
                    audit.record(entry);
                    flush_logged(&mut audit).await;
                }
            }
            appended
        };

        let id = appended?;
        info!("Enqueued {} item {}", kind, id);
        if self.inner.publisher.snapshot().online {
            self.inner.trigger.notify_one();
        }
        Ok(id)
    }

    /// Run one drain pass now, unless one is already running.
    ///
    /// Never returns handler-level errors; those are reflected in item
    /// status and the summary.
    pub async fn drain(&self) -> SyncSummary {
        let started = Instant::now();
        let Ok(_pass) = self.inner.pass_guard.try_lock() else {
            debug!("Drain pass already running; skipping");
            return SyncSummary::skipped(started);
        };
        self.guarded_pass(started).await
    }

    /// Run a drain pass now, waiting for any in-flight pass to finish first.
    pub async fn force_sync_now(&self) -> SyncSummary {
        let started = Instant::now();
        let _pass = self.inner.pass_guard.lock().await;
        self.guarded_pass(started).await
    }

    /// Drop every queued item, including Failed ones.
    ///
    /// Returns the number of items removed. A Processing item whose handler
    /// is still running finishes, but its outcome is discarded.
    ///
    /// # Errors
    /// - `Shutdown` after [`shutdown`](Self::shutdown)
    /// - `Persistence` if the empty queue could not be written
    pub async fn clear_queue(&self) -> Result<usize> {
        self.ensure_running()?;
        let mut queue = self.inner.queue.lock().await;
        let cleared = queue.clear().await;
        self.publish_queue(&queue);

        let cleared = cleared?;
        let mut audit = self.inner.audit.lock().await;
        for item in &cleared {
            audit.record(AuditEntry::for_item(item, AuditEvent::Cleared));
        }
        flush_logged(&mut audit).await;

        warn!("Cleared {} queued items", cleared.len());
        Ok(cleared.len())
    }

    /// Prune terminal items and audit entries older than `days_to_keep` days.
    ///
    /// # Errors
    /// - `Shutdown` after [`shutdown`](Self::shutdown)
    /// - `Persistence` if the pruned queue or audit log could not be written
    pub async fn cleanup(&self, days_to_keep: u32) -> Result<PruneReport> {
        self.ensure_running()?;
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days_to_keep));
        let mut queue = self.inner.queue.lock().await;
        let mut audit = self.inner.audit.lock().await;
        let report = self.inner.accountant.prune(&mut queue, &mut audit, cutoff).await;
        self.publish_queue(&queue);
        report
    }

    /// Bytes persisted under the namespace against the configured quota.
    pub async fn usage(&self) -> Result<StorageUsage> {
        self.inner.accountant.usage().await
    }

    /// Export every persisted key and the current state.
    ///
    /// Waits for an in-flight pass so the bundle never captures items
    /// mid-processing.
    pub async fn export(&self) -> Result<ExportBundle> {
        let _pass = self.inner.pass_guard.lock().await;
        let queue = self.inner.queue.lock().await;
        queue.persist().await?;
        self.inner.audit.lock().await.flush().await?;
        drop(queue);

        let bundle = ExportBundle::collect(
            self.inner.backend.as_ref(),
            &self.inner.namespace,
            self.inner.publisher.snapshot(),
        )
        .await?;
        info!("Exported {} keys", bundle.entries.len());
        Ok(bundle)
    }

    /// Replace all persisted state with `bundle`, then run a forced pass.
    ///
    /// Destructive: the current queue, metadata and audit trail are
    /// discarded. `data_version` is bumped so dependent caches refresh.
    ///
    /// If restoring fails partway, the in-memory queue is still the current
    /// one and is written back over the partial restore.
    ///
    /// # Errors
    /// - `Shutdown` after [`shutdown`](Self::shutdown)
    /// - Malformed bundle, or a backend failure while restoring
    pub async fn import(&self, bundle: ExportBundle) -> Result<SyncSummary> {
        self.ensure_running()?;
        {
            let _pass = self.inner.pass_guard.lock().await;
            let mut queue = self.inner.queue.lock().await;
            let mut audit = self.inner.audit.lock().await;
            let queue_key = self.inner.config.queue_key()?;

            let restored = match bundle
                .restore(self.inner.backend.as_ref(), &self.inner.namespace)
                .await
            {
                Ok(_) => QueueStore::open(self.inner.backend.clone(), queue_key).await,
                Err(e) => Err(e),
            };
            match restored {
                Ok(restored) => *queue = restored,
                Err(e) => {
                    error!("Import failed, rewriting current state: {}", e);
                    self.rewrite_current(&queue, &mut audit).await;
                    return Err(e);
                }
            }
            audit.reload().await?;

            let restored = load_meta(self.inner.backend.as_ref(), &self.inner.meta_key).await?;
            let previous = self.inner.publisher.snapshot().data_version;
            let meta = SyncMeta {
                last_sync_time: restored.last_sync_time,
                data_version: restored.data_version.max(previous) + 1,
            };
            if let Err(e) = self.persist_meta(&meta).await {
                warn!("Imported state without updated metadata: {}", e);
            }

            for item in queue.items() {
                audit.record(AuditEntry::for_item(item, AuditEvent::Imported));
            }
            flush_logged(&mut audit).await;

            let queued_items = visible_items(&queue);
            self.inner.publisher.update(|state| {
                state.queued_items = queued_items;
                state.last_sync_time = meta.last_sync_time;
                state.data_version = meta.data_version;
            });
            info!(
                "Imported {} queued items from {} (data version {})",
                queue.len(),
                bundle.namespace,
                meta.data_version
            );
        }

        Ok(self.force_sync_now().await)
    }

    /// Register a state listener. It is removed when the returned
    /// subscription is dropped.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(SyncState) + Send + Sync + 'static,
    {
        self.inner.publisher.subscribe(listener)
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> SyncState {
        self.inner.publisher.snapshot()
    }

    /// Receiver that always holds the latest state.
    pub fn watch(&self) -> watch::Receiver<SyncState> {
        self.inner.publisher.watch()
    }

    /// Audit entries for one item, oldest first.
    pub async fn audit_trail(&self, id: &ItemId) -> Vec<AuditEntry> {
        let audit = self.inner.audit.lock().await;
        audit.entries_for(id).into_iter().cloned().collect()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Stop the worker, let an in-flight pass finish, and persist final state.
    ///
    /// Afterwards no pass runs, `enqueue` fails with `Shutdown`, and every
    /// listener is dropped. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down sync engine");
        self.inner.cancel.cancel();

        let worker = match self.inner.worker.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                error!("Sync worker ended abnormally: {}", e);
            }
        }

        let _pass = self.inner.pass_guard.lock().await;
        let queue = self.inner.queue.lock().await;
        if let Err(e) = queue.persist().await {
            error!("Final queue write failed: {}", e);
        }
        drop(queue);
        flush_logged(&mut *self.inner.audit.lock().await).await;
        if let Err(e) = self.persist_meta(&self.current_meta()).await {
            error!("Final metadata write failed: {}", e);
        }

        self.inner.publisher.clear_listeners();
        info!("Sync engine shut down");
    }

    /// Record a reachability change reported by the network monitor.
    pub(crate) fn set_online(&self, online: bool) {
        if self.inner.publisher.snapshot().online != online {
            self.inner.publisher.update(|state| state.online = online);
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    /// Body of a pass; the caller holds `pass_guard`.
    async fn guarded_pass(&self, started: Instant) -> SyncSummary {
        if self.is_shut_down() {
            debug!("Engine is shut down; skipping drain pass");
            return SyncSummary::skipped(started);
        }

        let online = match self.inner.monitor.is_online().await {
            Ok(online) => online,
            Err(e) => {
                warn!("Reachability check failed, assuming online: {}", e);
                true
            }
        };
        self.set_online(online);
        if !online {
            debug!("Offline; skipping drain pass");
            return SyncSummary::skipped(started);
        }

        self.run_pass(started).await
    }

    async fn run_pass(&self, started: Instant) -> SyncSummary {
        let mut summary = SyncSummary::default();
        let mut full_resyncs = 0u64;
        self.inner.publisher.update(|state| state.sync_in_progress = true);

        let due = self.inner.queue.lock().await.due_items(Utc::now());
        info!("Drain pass started with {} due items", due.len());

        for snapshot in due {
            {
                let mut queue = self.inner.queue.lock().await;
                match queue.get_mut(&snapshot.id) {
                    Some(item) if item.status == ItemStatus::Pending => item.mark_processing(),
                    _ => continue,
                }
                self.publish_queue(&queue);
            }

            // The queue lock is not held while the handler runs.
            let outcome = self.invoke(&snapshot).await;

            let mut queue = self.inner.queue.lock().await;
            let Some(item) = queue.get_mut(&snapshot.id) else {
                debug!("Item {} was removed while processing", snapshot.id);
                continue;
            };
            let event = match outcome {
                Outcome::Applied => {
                    item.mark_completed();
                    summary.processed += 1;
                    if item.kind == ItemKind::FullResync {
                        full_resyncs += 1;
                    }
                    debug!("Item {} completed", item.id);
                    AuditEvent::Completed
                }
                Outcome::Failed(reason) => {
                    summary.failed += 1;
                    summary.errors.push(format!("{}: {}", item.id, reason));
                    let next_attempt_at = self
                        .inner
                        .config
                        .retry
                        .next_attempt_at(item.retry_count + 1, Utc::now());
                    match item.record_failure(reason, next_attempt_at) {
                        ItemStatus::Failed => {
                            summary.exhausted += 1;
                            warn!(
                                "Item {} failed after {} attempts; giving up",
                                item.id, item.retry_count
                            );
                            AuditEvent::Failed
                        }
                        _ => AuditEvent::Retried,
                    }
                }
                Outcome::Unroutable(reason) => {
                    summary.failed += 1;
                    summary.exhausted += 1;
                    summary.errors.push(format!("{}: {}", item.id, reason));
                    item.mark_failed(reason);
                    AuditEvent::Failed
                }
            };
            let entry = AuditEntry::for_item(item, event);
            self.publish_queue(&queue);
            self.inner.audit.lock().await.record(entry);
        }

        let data_version = self.inner.publisher.snapshot().data_version + full_resyncs;
        let finished_at = Utc::now();
        let queued_items = {
            let mut queue = self.inner.queue.lock().await;
            queue.take_completed();
            let store: &QueueStore = &queue;
            if let Err(e) = self.inner.write_back.execute(|| store.persist()).await {
                summary.errors.push(format!("queue write-back: {}", e));
            }
            visible_items(&queue)
        };

        let meta = SyncMeta {
            last_sync_time: Some(finished_at),
            data_version,
        };
        if let Err(e) = self.inner.write_back.execute(|| self.persist_meta(&meta)).await {
            summary.errors.push(format!("metadata write-back: {}", e));
        }
        if let Err(e) = self.inner.audit.lock().await.flush().await {
            summary.errors.push(format!("audit write-back: {}", e));
        }

        if full_resyncs > 0 {
            info!("Full resync completed; data version is now {}", data_version);
        }
        self.inner.publisher.update(|state| {
            state.queued_items = queued_items;
            state.last_sync_time = Some(finished_at);
            state.data_version = data_version;
            state.sync_in_progress = false;
        });

        summary.duration = started.elapsed();
        info!(
            "Drain pass finished: {} processed, {} failed ({} exhausted) in {:?}",
            summary.processed, summary.failed, summary.exhausted, summary.duration
        );
        summary
    }

    /// Resolve and run the processor for `item`, capturing panics.
    async fn invoke(&self, item: &QueueItem) -> Outcome {
        let processor = match self.inner.processors.resolve(item.kind) {
            Ok(processor) => processor,
            Err(e) => {
                error!(
                    "Configuration error: item {} has kind {} with no registered processor",
                    item.id, item.kind
                );
                return Outcome::Unroutable(e.to_string());
            }
        };

        match AssertUnwindSafe(processor.process(item)).catch_unwind().await {
            Ok(Ok(())) => Outcome::Applied,
            Ok(Err(e)) => {
                warn!("Processor for {} failed on item {}: {}", item.kind, item.id, e);
                Outcome::Failed(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(
                    "Processor for {} panicked on item {}: {}",
                    item.kind, item.id, message
                );
                Outcome::Failed(format!("processor panicked: {}", message))
            }
        }
    }

    fn publish_queue(&self, queue: &QueueStore) {
        let queued_items = visible_items(queue);
        self.inner
            .publisher
            .update(|state| state.queued_items = queued_items);
    }

    /// Write the in-memory queue, audit trail and metadata over whatever a
    /// failed import left in the backend.
    async fn rewrite_current(&self, queue: &QueueStore, audit: &mut AuditLog) {
        if let Err(e) = queue.persist().await {
            error!("Queue not rewritten: {}", e);
        }
        if let Err(e) = audit.rewrite().await {
            warn!("Audit log not rewritten: {}", e);
        }
        if let Err(e) = self.persist_meta(&self.current_meta()).await {
            warn!("Metadata not rewritten: {}", e);
        }
    }

    fn current_meta(&self) -> SyncMeta {
        let state = self.inner.publisher.snapshot();
        SyncMeta {
            last_sync_time: state.last_sync_time,
            data_version: state.data_version,
        }
    }

    async fn persist_meta(&self, meta: &SyncMeta) -> Result<()> {
        let data = serde_json::to_vec(meta)?;
        self.inner
            .backend
            .write(&self.inner.meta_key, data)
            .await
            .map_err(|e| Error::Persistence(format!("meta {}: {}", self.inner.meta_key, e)))
    }
}

/// Items shown to observers: everything not yet removed as Completed.
fn visible_items(queue: &QueueStore) -> Vec<QueueItem> {
    queue
        .items()
        .iter()
        .filter(|item| item.status != ItemStatus::Completed)
        .cloned()
        .collect()
}

async fn load_meta(backend: &dyn StorageBackend, key: &StoreKey) -> Result<SyncMeta> {
    let Some(data) = backend.read(key).await? else {
        return Ok(SyncMeta::default());
    };
    Ok(serde_json::from_slice(&data).unwrap_or_else(|e| {
        warn!("Ignoring unreadable sync metadata {}: {}", key, e);
        SyncMeta::default()
    }))
}

async fn flush_logged(audit: &mut AuditLog) {
    if let Err(e) = audit.flush().await {
        warn!("Audit log not flushed: {}", e);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
