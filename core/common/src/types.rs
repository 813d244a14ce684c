//! Common types used throughout offsync.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a queued item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemId(String);

impl ItemId {
    /// Create an ItemId from a string.
    ///
    /// # Preconditions
    /// - `id` must be non-empty after trimming
    ///
    /// # Errors
    /// - Returns error if id is empty
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(crate::Error::InvalidInput(
                "ItemId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A key in a storage backend.
///
/// Keys are '/'-separated component lists, e.g. `offsync/queue`. Every key
/// the engine writes lives under a namespace key, which is what lets the
/// storage accountant find all of them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreKey {
    components: Vec<String>,
}

impl StoreKey {
    /// Create a key from string components.
    ///
    /// # Preconditions
    /// - At least one component
    /// - Components must not be empty, contain separators, or start with `.`
    ///
    /// # Errors
    /// - Returns error if any component is invalid
    pub fn from_components(components: Vec<String>) -> crate::Result<Self> {
        if components.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Store key cannot be empty".to_string(),
            ));
        }
        for comp in &components {
            Self::validate_component(comp)?;
        }
        Ok(Self { components })
    }

    /// Parse a key string using '/' as separator.
    pub fn parse(key: &str) -> crate::Result<Self> {
        let key = key.trim_start_matches('/').trim_end_matches('/');
        if key.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Store key cannot be empty".to_string(),
            ));
        }
        let components: Vec<String> = key.split('/').map(String::from).collect();
        Self::from_components(components)
    }

    fn validate_component(comp: &str) -> crate::Result<()> {
        if comp.is_empty() {
            return Err(crate::Error::InvalidInput(
                "Key component cannot be empty".to_string(),
            ));
        }
        if comp.contains('/') || comp.contains('\\') {
            return Err(crate::Error::InvalidInput(
                "Key component cannot contain separators".to_string(),
            ));
        }
        // Dot-prefixed names are reserved for backend temp files.
        if comp.starts_with('.') {
            return Err(crate::Error::InvalidInput(format!(
                "Key component cannot start with '.': '{}'",
                comp
            )));
        }
        Ok(())
    }

    /// Join this key with a child component.
    pub fn join(&self, child: &str) -> crate::Result<Self> {
        Self::validate_component(child)?;
        let mut components = self.components.clone();
        components.push(child.to_string());
        Ok(Self { components })
    }

    /// Whether `self` equals `prefix` or lies underneath it.
    pub fn starts_with(&self, prefix: &StoreKey) -> bool {
        self.components.len() >= prefix.components.len()
            && self.components[..prefix.components.len()] == prefix.components[..]
    }

    /// Get the last component.
    pub fn name(&self) -> &str {
        self.components.last().map(|s| s.as_str()).unwrap_or_default()
    }

    /// Get the key components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Convert to a string representation.
    pub fn to_string_key(&self) -> String {
        self.components.join("/")
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_item_id_creation() {
        let id = ItemId::new("item-1").unwrap();
        assert_eq!(id.as_str(), "item-1");
    }

    #[test]
    fn test_item_id_empty_fails() {
        assert!(ItemId::new("").is_err());
        assert!(ItemId::new("   ").is_err());
    }

    #[test]
    fn test_item_id_generate_unique() {
        assert_ne!(ItemId::generate(), ItemId::generate());
    }

    #[test]
    fn test_store_key_parse() {
        let key = StoreKey::parse("/offsync/queue/").unwrap();
        assert_eq!(key.components(), &["offsync", "queue"]);
        assert_eq!(key.to_string_key(), "offsync/queue");
        assert_eq!(key.name(), "queue");
    }

    #[test]
    fn test_store_key_rejects_bad_components() {
        assert!(StoreKey::parse("").is_err());
        assert!(StoreKey::parse("a//b").is_err());
        assert!(StoreKey::parse("a/../b").is_err());
        assert!(StoreKey::parse("offsync").unwrap().join("x\\y").is_err());
    }

    #[test]
    fn test_store_key_rejects_hidden_components() {
        let ns = StoreKey::parse("offsync").unwrap();
        assert!(ns.join(".queue").is_err());
        assert!(StoreKey::parse("offsync/.hidden/queue").is_err());
        assert!(StoreKey::parse(".").is_err());
        assert!(ns.join("queue.v2").is_ok());
    }

    #[test]
    fn test_store_key_starts_with() {
        let ns = StoreKey::parse("offsync").unwrap();
        let queue = ns.join("queue").unwrap();
        let other = StoreKey::parse("offsyncx/queue").unwrap();

        assert!(queue.starts_with(&ns));
        assert!(ns.starts_with(&ns));
        assert!(!other.starts_with(&ns));
        assert!(!ns.starts_with(&queue));
    }

    proptest! {
        #[test]
        fn prop_store_key_display_parses_back(parts in proptest::collection::vec("[a-z0-9_-]{1,8}", 1..5)) {
            let key = StoreKey::from_components(parts.clone()).unwrap();
            let reparsed = StoreKey::parse(&key.to_string()).unwrap();
            prop_assert_eq!(reparsed.components(), &parts[..]);
        }
    }
}
