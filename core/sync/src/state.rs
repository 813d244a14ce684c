//! Observable sync state and its publisher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tracing::{error, warn};

use crate::queue::{ItemStatus, QueueItem};

/// Snapshot of the engine's state, broadcast after every mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    /// Last known reachability.
    pub online: bool,
    /// Pending, Processing and Failed items.
    pub queued_items: Vec<QueueItem>,
    /// Whether a drain pass is running.
    pub sync_in_progress: bool,
    /// End of the most recent drain pass.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Bumped on every full resync; dependent caches compare it to detect staleness.
    pub data_version: u64,
}

impl SyncState {
    /// Count items in `status`.
    pub fn count_with_status(&self, status: ItemStatus) -> usize {
        self.queued_items.iter().filter(|i| i.status == status).count()
    }

    /// Items that exhausted their retries or could not be routed.
    pub fn failed_items(&self) -> Vec<&QueueItem> {
        self.queued_items
            .iter()
            .filter(|i| i.status == ItemStatus::Failed)
            .collect()
    }

    /// Whether anything is still waiting to be applied.
    pub fn has_pending_work(&self) -> bool {
        self.queued_items
            .iter()
            .any(|i| matches!(i.status, ItemStatus::Pending | ItemStatus::Processing))
    }
}

type Listener = Arc<dyn Fn(SyncState) + Send + Sync>;

struct Listeners {
    next_id: u64,
    by_id: BTreeMap<u64, Listener>,
}

struct Shared {
    /// Held across mutation and fan-out so listeners see changes in order.
    /// Lock order: `delivery`, then `state`.
    delivery: Mutex<()>,
    state: Mutex<SyncState>,
    listeners: Mutex<Listeners>,
    watch_tx: watch::Sender<SyncState>,
}

/// Holds the single [`SyncState`] and fans every change out to subscribers.
///
/// Listeners are called synchronously, in subscription order, each with its
/// own copy of the state. Concurrent updates are delivered one at a time in
/// the order they were applied, so the last state a listener sees is always
/// the current one. A panicking listener is logged and skipped. Listeners may
/// subscribe or unsubscribe but must not call [`update`](Self::update).
#[derive(Clone)]
pub struct StatePublisher {
    shared: Arc<Shared>,
}

impl StatePublisher {
    /// Create a publisher holding `initial`.
    pub fn new(initial: SyncState) -> Self {
        let (watch_tx, _rx) = watch::channel(initial.clone());
        Self {
            shared: Arc::new(Shared {
                delivery: Mutex::new(()),
                state: Mutex::new(initial),
                listeners: Mutex::new(Listeners {
                    next_id: 0,
                    by_id: BTreeMap::new(),
                }),
                watch_tx,
            }),
        }
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> SyncState {
        lock(&self.shared.state).clone()
    }

    /// Register a listener. It stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(SyncState) + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.shared.listeners);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.by_id.insert(id, Arc::new(listener));
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Receiver for async observers; always holds the latest state.
    pub fn watch(&self) -> watch::Receiver<SyncState> {
        self.shared.watch_tx.subscribe()
    }

    /// Apply `mutate` to the state and broadcast the result.
    pub fn update(&self, mutate: impl FnOnce(&mut SyncState)) {
        let _delivery = lock(&self.shared.delivery);
        let snapshot = {
            let mut state = lock(&self.shared.state);
            mutate(&mut state);
            // Published under the lock so watchers never see updates reordered.
            self.shared.watch_tx.send_replace(state.clone());
            state.clone()
        };
        self.broadcast(snapshot);
    }

    /// Drop every listener.
    pub fn clear_listeners(&self) {
        lock(&self.shared.listeners).by_id.clear();
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        lock(&self.shared.listeners).by_id.len()
    }

    fn broadcast(&self, snapshot: SyncState) {
        // Listeners run outside the lock so they may subscribe or unsubscribe.
        let listeners: Vec<(u64, Listener)> = lock(&self.shared.listeners)
            .by_id
            .iter()
            .map(|(id, l)| (*id, l.clone()))
            .collect();

        for (id, listener) in listeners {
            let copy = snapshot.clone();
            if catch_unwind(AssertUnwindSafe(|| listener(copy))).is_err() {
                error!("State listener {} panicked; continuing with remaining listeners", id);
            }
        }
    }
}

/// Handle returned by [`StatePublisher::subscribe`].
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Remove the listener now.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            lock(&shared.listeners).by_id.remove(&self.id);
        }
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("Recovering poisoned state lock");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ItemKind, NewItem};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_update_broadcasts_copy() {
        let publisher = StatePublisher::new(SyncState::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let _sub = publisher.subscribe(move |mut state| {
            seen_clone.lock().unwrap().push(state.online);
            // Mutating the copy must not leak back into the publisher.
            state.data_version = 99;
        });

        publisher.update(|s| s.online = true);
        publisher.update(|s| s.online = false);

        assert_eq!(*seen.lock().unwrap(), vec![true, false]);
        assert_eq!(publisher.snapshot().data_version, 0);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let publisher = StatePublisher::new(SyncState::default());
        let delivered = Arc::new(AtomicUsize::new(0));

        let _bad = publisher.subscribe(|_| panic!("listener bug"));
        let delivered_clone = delivered.clone();
        let _good = publisher.subscribe(move |_| {
            delivered_clone.fetch_add(1, Ordering::SeqCst);
        });

        publisher.update(|s| s.sync_in_progress = true);
        publisher.update(|s| s.sync_in_progress = false);

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let publisher = StatePublisher::new(SyncState::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let sub = publisher.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });
        publisher.update(|s| s.online = true);
        sub.unsubscribe();
        publisher.update(|s| s.online = false);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.listener_count(), 0);
    }

    #[test]
    fn test_concurrent_updates_reach_listeners_in_order() {
        let publisher = StatePublisher::new(SyncState::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let _sub = publisher.subscribe(move |state| {
            if state.data_version == 1 {
                std::thread::sleep(std::time::Duration::from_millis(200));
            }
            seen_clone.lock().unwrap().push(state.data_version);
        });

        let first = {
            let publisher = publisher.clone();
            std::thread::spawn(move || publisher.update(|s| s.data_version = 1))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        let second = {
            let publisher = publisher.clone();
            std::thread::spawn(move || publisher.update(|s| s.data_version = 2))
        };
        first.join().unwrap();
        second.join().unwrap();

        assert_eq!(publisher.snapshot().data_version, 2);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_listener_may_unsubscribe_during_delivery() {
        let publisher = StatePublisher::new(SyncState::default());
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let calls = Arc::new(AtomicUsize::new(0));

        let (slot_clone, calls_clone) = (slot.clone(), calls.clone());
        let sub = publisher.subscribe(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            drop(slot_clone.lock().unwrap().take());
        });
        *slot.lock().unwrap() = Some(sub);

        publisher.update(|s| s.online = true);
        publisher.update(|s| s.online = false);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_watch_receives_latest() {
        let publisher = StatePublisher::new(SyncState::default());
        let mut rx = publisher.watch();

        publisher.update(|s| s.data_version = 3);

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().data_version, 3);
    }

    #[test]
    fn test_state_queries() {
        let mut failed = NewItem::new(ItemKind::AdminAction, json!({})).into_item(1);
        failed.mark_failed("boom");
        let pending = NewItem::new(ItemKind::RecordSubmit, json!({})).into_item(1);

        let state = SyncState {
            queued_items: vec![failed, pending],
            ..SyncState::default()
        };

        assert_eq!(state.count_with_status(ItemStatus::Failed), 1);
        assert_eq!(state.failed_items().len(), 1);
        assert!(state.has_pending_work());
    }
}
