//! Name-to-backend table used to pick a store from configuration.

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use offsync_common::{Error, Result};
use crate::backend::StorageBackend;
use crate::local::LocalBackend;
use crate::memory::MemoryBackend;

/// Builds a backend from its JSON configuration.
pub type BackendFactory = fn(&Value) -> Result<Arc<dyn StorageBackend>>;

/// Table of backend constructors keyed by name.
///
/// The default table knows `memory` (no configuration) and `local`
/// (`{ "root": "<directory>" }`, with an optional `"base_dir"` the root is
/// resolved against when relative).
pub struct BackendRegistry {
    factories: BTreeMap<&'static str, BackendFactory>,
}

impl BackendRegistry {
    /// A table with no backends.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Add or replace the constructor for `name`.
    pub fn with_backend(mut self, name: &'static str, factory: BackendFactory) -> Self {
        self.factories.insert(name, factory);
        self
    }

    /// Construct the backend registered as `name`.
    ///
    /// # Errors
    /// - `NotFound` naming the known backends if `name` is unknown
    /// - `InvalidInput` if `config` does not fit the backend
    /// - Whatever the backend's own constructor reports
    pub fn open(&self, name: &str, config: &Value) -> Result<Arc<dyn StorageBackend>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            Error::NotFound(format!(
                "Unknown storage backend '{}' (available: {})",
                name,
                self.names().collect::<Vec<_>>().join(", ")
            ))
        })?;
        let backend = factory(config)?;
        debug!("Opened '{}' storage backend", backend.name());
        Ok(backend)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.factories.keys().copied()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::empty()
            .with_backend("memory", open_memory)
            .with_backend("local", open_local)
    }
}

fn open_memory(_config: &Value) -> Result<Arc<dyn StorageBackend>> {
    Ok(Arc::new(MemoryBackend::new()))
}

fn open_local(config: &Value) -> Result<Arc<dyn StorageBackend>> {
    let root = config
        .get("root")
        .and_then(Value::as_str)
        .filter(|root| !root.is_empty())
        .ok_or_else(|| Error::InvalidInput("Local backend requires a 'root' path".to_string()))?;

    let mut path = PathBuf::from(root);
    if path.is_relative() {
        if let Some(base) = config.get("base_dir").and_then(Value::as_str) {
            path = PathBuf::from(base).join(path);
        }
    }
    Ok(Arc::new(LocalBackend::new(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_default_backends() {
        let registry = BackendRegistry::default();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["local", "memory"]);

        let memory = registry.open("memory", &Value::Null).unwrap();
        assert_eq!(memory.name(), "memory");
    }

    #[test]
    fn test_unknown_backend_lists_alternatives() {
        let registry = BackendRegistry::default();
        match registry.open("s3", &Value::Null) {
            Err(Error::NotFound(message)) => assert!(message.contains("local, memory")),
            _ => panic!("expected NotFound"),
        }
    }

    #[test]
    fn test_local_root_is_required() {
        let registry = BackendRegistry::default();
        assert!(matches!(
            registry.open("local", &json!({})),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            registry.open("local", &json!({ "root": "" })),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_local_root_relative_to_base_dir() {
        let temp = TempDir::new().unwrap();
        let backend = BackendRegistry::default()
            .open(
                "local",
                &json!({ "root": "store", "base_dir": temp.path().to_str().unwrap() }),
            )
            .unwrap();

        assert_eq!(backend.name(), "local");
        assert!(temp.path().join("store").is_dir());
    }

    #[test]
    fn test_custom_backend_replaces_builtin() {
        fn always_fails(_: &Value) -> Result<Arc<dyn StorageBackend>> {
            Err(Error::Storage("disabled".to_string()))
        }
        let registry = BackendRegistry::default().with_backend("memory", always_fails);

        assert!(matches!(registry.open("memory", &Value::Null), Err(Error::Storage(_))));
        assert_eq!(registry.names().count(), 2);
    }
}
