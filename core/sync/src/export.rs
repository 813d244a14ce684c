//! Full-state export and import.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use offsync_common::{Error, Result, StoreKey};
use offsync_storage::StorageBackend;

use crate::state::SyncState;

/// Bundle format written by this version.
pub const EXPORT_FORMAT_VERSION: u32 = 1;

/// Backup of everything the engine persisted, plus the state at export time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportBundle {
    pub format_version: u32,
    pub exported_at: DateTime<Utc>,
    /// Namespace the bundle was taken from. Import may target another one.
    pub namespace: String,
    /// Persisted values by key relative to the namespace, base64-encoded.
    pub entries: BTreeMap<String, String>,
    pub state: SyncState,
}

impl ExportBundle {
    /// Read every key under `namespace`.
    pub async fn collect(
        backend: &dyn StorageBackend,
        namespace: &StoreKey,
        state: SyncState,
    ) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for key in backend.list(namespace).await? {
            let Some(data) = backend.read(&key).await? else {
                continue;
            };
            let relative = key.components()[namespace.components().len()..].join("/");
            if relative.is_empty() {
                continue;
            }
            entries.insert(relative, STANDARD.encode(data));
        }

        debug!("Collected {} keys under {} for export", entries.len(), namespace);
        Ok(Self {
            format_version: EXPORT_FORMAT_VERSION,
            exported_at: Utc::now(),
            namespace: namespace.to_string_key(),
            entries,
            state,
        })
    }

    /// Replace everything under `namespace` with the bundle's contents.
    ///
    /// Entries are decoded up front, so a malformed bundle leaves the
    /// backend untouched. Bundle keys are written before stale keys are
    /// deleted; a failure partway leaves every key either old or new, never
    /// missing. Returns the number of keys written.
    ///
    /// # Errors
    /// - Malformed key or value in the bundle
    /// - Backend failure while deleting or writing
    pub async fn restore(&self, backend: &dyn StorageBackend, namespace: &StoreKey) -> Result<usize> {
        let mut decoded = Vec::with_capacity(self.entries.len());
        for (relative, value) in &self.entries {
            let relative_key = StoreKey::parse(relative)?;
            let mut components = namespace.components().to_vec();
            components.extend_from_slice(relative_key.components());
            let key = StoreKey::from_components(components)?;
            let data = STANDARD.decode(value).map_err(|e| {
                Error::Serialization(format!("Bad value for '{}' in export bundle: {}", relative, e))
            })?;
            decoded.push((key, data));
        }

        for (key, data) in &decoded {
            backend.write(key, data.clone()).await?;
        }
        let mut stale = 0;
        for key in backend.list(namespace).await? {
            if !decoded.iter().any(|(written, _)| *written == key) {
                backend.delete(&key).await?;
                stale += 1;
            }
        }
        debug!("Removed {} keys not present in the bundle", stale);

        info!(
            "Restored {} keys from bundle of {} into {}",
            decoded.len(),
            self.namespace,
            namespace
        );
        Ok(decoded.len())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a bundle, rejecting formats newer than this version.
    pub fn from_json(data: &str) -> Result<Self> {
        let bundle: Self = serde_json::from_str(data)?;
        if bundle.format_version > EXPORT_FORMAT_VERSION {
            return Err(Error::InvalidInput(format!(
                "Unsupported export format version {}",
                bundle.format_version
            )));
        }
        Ok(bundle)
    }
}
