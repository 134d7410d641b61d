//! # Key-Value Storage
//!
//! String key/value areas with a per-key change marker, and the
//! [`StorageBackend`] adapter that persists a cart into one of them.
//!
//! ## Storage Areas
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      KeyValueStorage                                    │
//! │                                                                         │
//! │  FileStorage (durable)              SessionStorage (process only)       │
//! │  ─────────────────────              ─────────────────────────────       │
//! │  <dir>/cart-state.json              HashMap<String, String>             │
//! │  <dir>/cart-state.marker            HashMap<String, u64>                │
//! │  written via temp file + rename     shared by clones                    │
//! │                                                                         │
//! │  Both enforce a byte quota (default 5 MiB) → QuotaExceeded              │
//! │                                                                         │
//! │  The marker increases on every set/remove. Other contexts poll it to    │
//! │  notice changes when no broadcast channel is available.                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use cartkit_core::validation::validate_storage_key;
use cartkit_core::{CartState, DEFAULT_STORAGE_QUOTA_BYTES};

use super::{Backend, BackendKind};
use crate::error::{StoreError, StoreResult};

// =============================================================================
// KeyValueStorage Trait
// =============================================================================

/// A string key/value area.
pub trait KeyValueStorage: Send + Sync + std::fmt::Debug {
    fn get_item(&self, key: &str) -> StoreResult<Option<String>>;

    fn set_item(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Removing an absent key is not an error.
    fn remove_item(&self, key: &str) -> StoreResult<()>;

    /// Monotonically increasing change counter for `key`; `0` if never written.
    fn modified_marker(&self, key: &str) -> StoreResult<u64>;

    /// `File` for durable areas, `Session` for process-scoped ones.
    fn kind(&self) -> BackendKind;
}

// =============================================================================
// File Storage
// =============================================================================

/// One JSON file per key inside a directory.
///
/// Clones share the same write lock, so contexts in one process that write
/// the same directory should share one `FileStorage`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
    quota_bytes: u64,
    write_lock: Arc<Mutex<()>>,
}

impl FileStorage {
    /// Opens (creating if needed) a storage directory.
    pub fn new(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            StoreError::PersistenceFailure(format!(
                "cannot create storage directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        debug!(dir = %dir.display(), "File storage opened");
        Ok(FileStorage {
            dir,
            quota_bytes: DEFAULT_STORAGE_QUOTA_BYTES,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Opens the platform data directory.
    ///
    /// ## Platform-Specific Paths
    /// - **macOS**: `~/Library/Application Support/dev.cartkit.cartkit/storage`
    /// - **Windows**: `%APPDATA%\cartkit\cartkit\data\storage`
    /// - **Linux**: `~/.local/share/cartkit/storage`
    pub fn open_default() -> StoreResult<Self> {
        let dir = Self::default_dir().ok_or_else(|| {
            StoreError::InvalidConfig("Could not determine app data directory".into())
        })?;
        Self::new(dir)
    }

    pub fn default_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "cartkit", "cartkit")
            .map(|dirs| dirs.data_dir().join("storage"))
    }

    /// Sets the byte quota for the whole directory.
    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Keys are used verbatim as file stems, so they must pass
    /// `validate_storage_key` first.
    fn record_path(&self, key: &str) -> StoreResult<PathBuf> {
        validate_storage_key(key)?;
        Ok(self.dir.join(format!("{}.json", key)))
    }

    fn marker_path(&self, key: &str) -> StoreResult<PathBuf> {
        validate_storage_key(key)?;
        Ok(self.dir.join(format!("{}.marker", key)))
    }

    /// Bytes used by every record except `exclude`.
    fn used_bytes_excluding(&self, exclude: &Path) -> StoreResult<u64> {
        let mut used = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path == exclude || path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            used += fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        }
        Ok(used)
    }

    fn read_marker(&self, key: &str) -> StoreResult<u64> {
        match fs::read_to_string(self.marker_path(key)?) {
            Ok(raw) => Ok(raw.trim().parse().unwrap_or(0)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn bump_marker(&self, key: &str) -> StoreResult<()> {
        let previous = self.read_marker(key)?;
        // Wall-clock floor keeps markers distinct across processes sharing the directory.
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let next = (previous + 1).max(now);
        write_atomic(&self.marker_path(key)?, next.to_string().as_bytes())
    }
}

impl KeyValueStorage for FileStorage {
    fn get_item(&self, key: &str) -> StoreResult<Option<String>> {
        match fs::read_to_string(self.record_path(key)?) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::PersistenceFailure(format!(
                "reading '{}': {}",
                key, e
            ))),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let path = self.record_path(key)?;

        let required = self.used_bytes_excluding(&path)? + value.len() as u64;
        if required > self.quota_bytes {
            return Err(StoreError::QuotaExceeded {
                key: key.to_string(),
                required,
                quota: self.quota_bytes,
            });
        }

        write_atomic(&path, value.as_bytes())?;
        self.bump_marker(key)?;
        debug!(key, bytes = value.len(), "Record written");
        Ok(())
    }

    fn remove_item(&self, key: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match fs::remove_file(self.record_path(key)?) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.bump_marker(key)
    }

    fn modified_marker(&self, key: &str) -> StoreResult<u64> {
        self.read_marker(key)
    }

    fn kind(&self) -> BackendKind {
        BackendKind::File
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let mut tmp: OsString = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes).map_err(|e| {
        StoreError::PersistenceFailure(format!("writing {}: {}", tmp.display(), e))
    })?;
    fs::rename(&tmp, path).map_err(|e| {
        StoreError::PersistenceFailure(format!("replacing {}: {}", path.display(), e))
    })
}

// =============================================================================
// Session Storage
// =============================================================================

#[derive(Debug, Default)]
struct SessionArea {
    items: HashMap<String, String>,
    markers: HashMap<String, u64>,
}

/// Process-scoped storage. Clones share one area; nothing outlives the process.
#[derive(Debug, Clone)]
pub struct SessionStorage {
    area: Arc<Mutex<SessionArea>>,
    quota_bytes: u64,
}

impl Default for SessionStorage {
    fn default() -> Self {
        SessionStorage {
            area: Arc::new(Mutex::new(SessionArea::default())),
            quota_bytes: DEFAULT_STORAGE_QUOTA_BYTES,
        }
    }
}

impl SessionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    fn area(&self) -> std::sync::MutexGuard<'_, SessionArea> {
        self.area.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeyValueStorage for SessionStorage {
    fn get_item(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.area().items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut area = self.area();

        // Keys count toward the quota as well as values.
        let others: u64 = area
            .items
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum();
        let required = others + (key.len() + value.len()) as u64;
        if required > self.quota_bytes {
            return Err(StoreError::QuotaExceeded {
                key: key.to_string(),
                required,
                quota: self.quota_bytes,
            });
        }

        area.items.insert(key.to_string(), value.to_string());
        *area.markers.entry(key.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> StoreResult<()> {
        let mut area = self.area();
        area.items.remove(key);
        *area.markers.entry(key.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn modified_marker(&self, key: &str) -> StoreResult<u64> {
        Ok(self.area().markers.get(key).copied().unwrap_or(0))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Session
    }
}

// =============================================================================
// Storage Backend
// =============================================================================

/// Persists the whole `CartState` as one JSON record under one key.
#[derive(Debug, Clone)]
pub struct StorageBackend {
    storage: Arc<dyn KeyValueStorage>,
    key: String,
}

impl StorageBackend {
    pub fn new(storage: Arc<dyn KeyValueStorage>, key: impl Into<String>) -> StoreResult<Self> {
        let key = key.into();
        validate_storage_key(&key)?;
        Ok(StorageBackend { storage, key })
    }

    /// Durable backend over a storage directory.
    pub fn file(storage: FileStorage, key: impl Into<String>) -> StoreResult<Self> {
        Self::new(Arc::new(storage), key)
    }

    /// Session-scoped backend.
    pub fn session(storage: SessionStorage, key: impl Into<String>) -> StoreResult<Self> {
        Self::new(Arc::new(storage), key)
    }

    /// The underlying area, for the sync fallback watcher.
    pub fn storage(&self) -> Arc<dyn KeyValueStorage> {
        Arc::clone(&self.storage)
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Backend for StorageBackend {
    fn save(&self, state: &CartState) -> StoreResult<()> {
        let json = serde_json::to_string(state)?;
        self.storage.set_item(&self.key, &json).map_err(|e| match e {
            StoreError::PersistenceFailure(msg) => {
                StoreError::PersistenceFailure(format!("saving cart to '{}': {}", self.key, msg))
            }
            other => other,
        })
    }

    fn load(&self) -> StoreResult<Option<CartState>> {
        match self.storage.get_item(&self.key)? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| {
                StoreError::PersistenceFailure(format!(
                    "cart record under '{}' is unreadable: {}",
                    self.key, e
                ))
            }),
        }
    }

    fn clear(&self) -> StoreResult<()> {
        self.storage.remove_item(&self.key)
    }

    fn kind(&self) -> BackendKind {
        self.storage.kind()
    }
}
