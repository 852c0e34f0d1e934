use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use crate::auth::mask_key;

/// Provider credentials a virtual key stands for.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct KeyRecord {
    #[serde(rename = "provider")]
    pub provider_id: String,
    pub api_key: String,
}

impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRecord")
            .field("provider_id", &self.provider_id)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct KeyFile {
    virtual_keys: HashMap<String, KeyRecord>,
}

/// Read-only view of the key file.
///
/// The file is re-read on every lookup so edits take effect without a
/// restart.
#[derive(Debug, Clone)]
pub struct KeyStore {
    path: PathBuf,
}

impl KeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up `virtual_key`. A missing file, a malformed file and an unknown
    /// key all return `None`.
    pub fn resolve(&self, virtual_key: &str) -> Option<KeyRecord> {
        let content = match std::fs::read(&self.path) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to read keys file");
                return None;
            }
        };

        let mut file: KeyFile = match serde_json::from_slice(&content) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to parse keys file");
                return None;
            }
        };

        let record = file.virtual_keys.remove(virtual_key);
        if record.is_none() {
            tracing::debug!(virtual_key = %mask_key(virtual_key), "Unknown virtual key");
        }
        record
    }

    /// [`Self::resolve`] on the blocking pool.
    pub async fn resolve_async(self: &Arc<Self>, virtual_key: &str) -> Option<KeyRecord> {
        let store = Arc::clone(self);
        let virtual_key = virtual_key.to_string();
        match tokio::task::spawn_blocking(move || store.resolve(&virtual_key)).await {
            Ok(record) => record,
            Err(e) => {
                tracing::error!(error = %e, "Key lookup task failed");
                None
            }
        }
    }
}
