//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use offsync_common::{Error, Result, StoreKey};

use crate::retry::RetryConfig;

/// Configuration for the sync engine.
///
/// Every field has a default, so a JSON file only needs the fields it
/// overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Key prefix for everything the engine persists.
    pub namespace: String,
    /// Time between background drain passes. `None` disables the timer.
    pub periodic_interval: Option<Duration>,
    /// Wait after an offline to online transition before draining.
    pub settle_delay: Duration,
    /// Retry budget for items enqueued without one.
    pub default_max_retries: u32,
    /// How failed items are rescheduled.
    pub retry: RetryConfig,
    /// Quota reported by storage usage queries.
    pub storage_quota_bytes: u64,
    /// Audit entries kept before the oldest are dropped.
    pub max_audit_entries: usize,
    /// Extra attempts for the end-of-pass write-back.
    pub persist_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            namespace: "offsync".to_string(),
            periodic_interval: Some(Duration::from_secs(30)),
            settle_delay: Duration::from_secs(2),
            default_max_retries: 3,
            retry: RetryConfig::default(),
            storage_quota_bytes: 5 * 1024 * 1024,
            max_audit_entries: 1000,
            persist_retries: 2,
        }
    }
}

impl SyncConfig {
    /// Load a JSON configuration file and validate it.
    ///
    /// # Errors
    /// - File cannot be read
    /// - Contents are not valid configuration
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&data)
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(data: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.namespace_key()?;
        if self.periodic_interval == Some(Duration::ZERO) {
            return Err(Error::InvalidInput(
                "periodic_interval must be greater than zero".to_string(),
            ));
        }
        if self.max_audit_entries == 0 {
            return Err(Error::InvalidInput(
                "max_audit_entries must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Root key of the namespace.
    pub fn namespace_key(&self) -> Result<StoreKey> {
        StoreKey::parse(&self.namespace)
            .map_err(|e| Error::InvalidInput(format!("Invalid namespace '{}': {}", self.namespace, e)))
    }

    pub fn queue_key(&self) -> Result<StoreKey> {
        self.namespace_key()?.join("queue")
    }

    pub fn meta_key(&self) -> Result<StoreKey> {
        self.namespace_key()?.join("meta")
    }

    pub fn audit_key(&self) -> Result<StoreKey> {
        self.namespace_key()?.join("audit")
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set or disable the periodic drain interval.
    pub fn with_periodic_interval(mut self, interval: Option<Duration>) -> Self {
        self.periodic_interval = interval;
        self
    }

    /// Set the reconnection settle delay.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set the default retry budget.
    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the storage quota.
    pub fn with_storage_quota(mut self, bytes: u64) -> Self {
        self.storage_quota_bytes = bytes;
        self
    }

    /// Set the audit log cap.
    pub fn with_max_audit_entries(mut self, entries: usize) -> Self {
        self.max_audit_entries = entries;
        self
    }

    /// Set write-back retry attempts.
    pub fn with_persist_retries(mut self, retries: u32) -> Self {
        self.persist_retries = retries;
        self
    }
}
