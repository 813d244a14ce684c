//! Item processors and the registry that maps item kinds to them.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use offsync_common::{Error, Result};

use crate::queue::{ItemKind, QueueItem};

/// Applies one kind of queued item to the authoritative store.
///
/// # Idempotence
/// The engine may call `process` more than once for the same item (for
/// example when a success response was lost and the attempt was counted as
/// a failure). A repeated call must leave the same observable effect as a
/// single call; use `item.id` as the idempotency key.
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// Apply the item. `Err` counts as a failed attempt.
    async fn process(&self, item: &QueueItem) -> Result<()>;
}

/// Processor backed by an async closure.
pub struct FnProcessor<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> ItemProcessor for FnProcessor<F>
where
    F: Fn(QueueItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn process(&self, item: &QueueItem) -> Result<()> {
        (self.f)(item.clone()).await
    }
}

/// Wrap an async closure as a processor.
pub fn processor_fn<F, Fut>(f: F) -> Arc<dyn ItemProcessor>
where
    F: Fn(QueueItem) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnProcessor { f })
}

/// Registry of processors by item kind.
///
/// Populated by the domain modules at startup, before the engine opens.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    processors: HashMap<ItemKind, Arc<dyn ItemProcessor>>,
}

impl ProcessorRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the processor for `kind`.
    ///
    /// # Errors
    /// - Returns error if `kind` already has a processor
    pub fn register(&mut self, kind: ItemKind, processor: Arc<dyn ItemProcessor>) -> Result<()> {
        if self.processors.contains_key(&kind) {
            return Err(Error::AlreadyExists(format!(
                "Processor for '{}' is already registered",
                kind
            )));
        }
        self.processors.insert(kind, processor);
        Ok(())
    }

    /// Resolve the processor for `kind`.
    ///
    /// # Errors
    /// - `NotFound` if nothing is registered; this is a configuration error
    pub fn resolve(&self, kind: ItemKind) -> Result<Arc<dyn ItemProcessor>> {
        self.processors
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("No processor registered for '{}'", kind)))
    }

    /// Kinds that have a processor.
    pub fn kinds(&self) -> Vec<ItemKind> {
        ItemKind::ALL
            .into_iter()
            .filter(|kind| self.processors.contains_key(kind))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::NewItem;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_register_and_resolve() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let mut registry = ProcessorRegistry::new();
        registry
            .register(
                ItemKind::RecordSubmit,
                processor_fn(move |_item| {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();

        let item = NewItem::new(ItemKind::RecordSubmit, json!({})).into_item(3);
        let processor = registry.resolve(ItemKind::RecordSubmit).unwrap();
        processor.process(&item).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.kinds(), vec![ItemKind::RecordSubmit]);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ProcessorRegistry::new();
        registry
            .register(ItemKind::AdminAction, processor_fn(|_| async { Ok(()) }))
            .unwrap();

        let result = registry.register(ItemKind::AdminAction, processor_fn(|_| async { Ok(()) }));
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = ProcessorRegistry::new();
        let result = registry.resolve(ItemKind::FullResync);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
