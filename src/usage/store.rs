//! File-backed usage store.
//!
//! The whole usage map lives in one pretty-printed JSON file. Every locked
//! operation re-reads the file, so the file stays the source of truth even if
//! something else replaced it between requests. Writes go to a sibling temp
//! file which is synced and then renamed over the live file; readers never see
//! a truncated map.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::config::WindowMode;
use crate::usage::{UsageError, UsageMap, UsageRecord};

/// Owner of the usage file and its in-memory copy.
///
/// One mutex serializes every read-check and commit, disk I/O included. Async
/// callers go through the `*_async` methods, which run on the blocking pool.
#[derive(Debug)]
pub struct UsageStore {
    path: PathBuf,
    window: WindowMode,
    state: Mutex<UsageMap>,
}

impl UsageStore {
    pub fn new(path: impl Into<PathBuf>, window: WindowMode) -> Self {
        Self {
            path: path.into(),
            window,
            state: Mutex::new(UsageMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Prepare the usage file at startup.
    ///
    /// With `reset` the file is overwritten with an empty map. Otherwise an
    /// absent file is created empty and an existing one must parse.
    pub fn initialize(&self, reset: bool) -> Result<(), UsageError> {
        let mut state = self.lock();

        if reset || !self.path.exists() {
            let empty = UsageMap::new();
            write_usage_file(&self.path, &empty)?;
            *state = empty;
            tracing::info!(path = %self.path.display(), reset, "Usage file initialized empty");
        } else {
            *state = read_usage_file(&self.path)?;
            tracing::info!(
                path = %self.path.display(),
                keys = state.len(),
                "Usage file loaded"
            );
        }
        Ok(())
    }

    /// Load the whole map under the lock. A missing or empty file is an empty map.
    pub fn load_snapshot(&self) -> Result<UsageMap, UsageError> {
        let mut state = self.lock();
        *state = read_usage_file(&self.path)?;
        Ok(state.clone())
    }

    /// Current record for one key, if any.
    pub fn read_for_key(&self, virtual_key: &str) -> Result<Option<UsageRecord>, UsageError> {
        let mut state = self.lock();
        *state = read_usage_file(&self.path)?;
        Ok(state.get(virtual_key).cloned())
    }

    /// Record one completed request and persist the map.
    pub fn commit_request(
        &self,
        virtual_key: &str,
        provider: &str,
        elapsed_ms: i64,
    ) -> Result<UsageRecord, UsageError> {
        self.commit_request_at(virtual_key, provider, elapsed_ms, Utc::now())
    }

    #[instrument(skip(self, virtual_key, now))]
    pub fn commit_request_at(
        &self,
        virtual_key: &str,
        provider: &str,
        elapsed_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<UsageRecord, UsageError> {
        let mut state = self.lock();
        *state = read_usage_file(&self.path)?;

        let updated = apply_commit(&mut state, virtual_key, provider, elapsed_ms, now, self.window);
        write_usage_file(&self.path, &state)?;

        tracing::debug!(
            request_count = updated.request_count,
            total_request_time_ms = updated.total_request_time_ms,
            last_reset = %updated.last_reset,
            "Updated usage"
        );
        Ok(updated)
    }

    /// Read the file without taking the lock. Unlike [`Self::load_snapshot`],
    /// a missing or unparseable file is an error.
    pub fn snapshot_unlocked(&self) -> Result<UsageMap, UsageError> {
        let content = std::fs::read(&self.path).map_err(|e| {
            UsageError::Read(format!("'{}': {}", self.path.display(), e))
        })?;
        serde_json::from_slice(&content).map_err(|e| UsageError::Parse(e.to_string()))
    }

    pub async fn initialize_async(self: &Arc<Self>, reset: bool) -> Result<(), UsageError> {
        self.run_blocking(move |store| store.initialize(reset)).await
    }

    pub async fn read_for_key_async(
        self: &Arc<Self>,
        virtual_key: &str,
    ) -> Result<Option<UsageRecord>, UsageError> {
        let virtual_key = virtual_key.to_string();
        self.run_blocking(move |store| store.read_for_key(&virtual_key))
            .await
    }

    pub async fn commit_request_async(
        self: &Arc<Self>,
        virtual_key: &str,
        provider: &str,
        elapsed_ms: i64,
    ) -> Result<UsageRecord, UsageError> {
        let virtual_key = virtual_key.to_string();
        let provider = provider.to_string();
        self.run_blocking(move |store| store.commit_request(&virtual_key, &provider, elapsed_ms))
            .await
    }

    pub async fn snapshot_unlocked_async(self: &Arc<Self>) -> Result<UsageMap, UsageError> {
        self.run_blocking(|store| store.snapshot_unlocked()).await
    }

    async fn run_blocking<T, F>(self: &Arc<Self>, op: F) -> Result<T, UsageError>
    where
        F: FnOnce(&UsageStore) -> Result<T, UsageError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| UsageError::Task(format!("spawn_blocking join error: {e}")))?
    }

    // The map is reloaded from disk by every operation, so nothing a
    // panicking holder left behind is ever trusted.
    fn lock(&self) -> MutexGuard<'_, UsageMap> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fold one committed request into `usage` and return the updated record.
pub fn apply_commit(
    usage: &mut UsageMap,
    virtual_key: &str,
    provider: &str,
    elapsed_ms: i64,
    now: DateTime<Utc>,
    window: WindowMode,
) -> UsageRecord {
    let record = usage
        .entry(virtual_key.to_string())
        .and_modify(|current| {
            if current.is_expired(now) {
                current.request_count = 1;
                current.total_request_time_ms = elapsed_ms;
                current.last_reset = now;
            } else {
                current.request_count = current.request_count.saturating_add(1);
                current.total_request_time_ms =
                    current.total_request_time_ms.saturating_add(elapsed_ms);
                if window == WindowMode::Floating {
                    current.last_reset = now;
                }
            }
            current.provider = provider.to_string();
        })
        .or_insert_with(|| UsageRecord::first(virtual_key, provider, elapsed_ms, now));
    record.clone()
}

fn read_usage_file(path: &Path) -> Result<UsageMap, UsageError> {
    let content = match std::fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(UsageMap::new()),
        Err(e) => {
            return Err(UsageError::Read(format!("'{}': {}", path.display(), e)));
        }
    };

    if content.iter().all(u8::is_ascii_whitespace) {
        return Ok(UsageMap::new());
    }

    serde_json::from_slice(&content).map_err(|e| UsageError::Parse(e.to_string()))
}

fn write_usage_file(path: &Path, usage: &UsageMap) -> Result<(), UsageError> {
    let content =
        serde_json::to_vec_pretty(usage).map_err(|e| UsageError::Serialize(e.to_string()))?;

    let temp_path = temp_path_for(path);
    let write_temp = || -> std::io::Result<()> {
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(&content)?;
        file.sync_all()
    };
    write_temp().map_err(|e| {
        UsageError::Write(format!("temp file '{}': {}", temp_path.display(), e))
    })?;

    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(UsageError::Write(format!(
            "rename '{}' to '{}': {}",
            temp_path.display(),
            path.display(),
            e
        )));
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
