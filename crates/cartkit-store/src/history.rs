//! # Cart History
//!
//! Bounded, newest-first list of cart snapshots.
//!
//! ## Snapshot Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  add_state(s, label, meta)                                              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  [new, e1, e2, ... e9]  ── len > max_entries? ──► drop the oldest       │
//! │       │                                                                 │
//! │       ├──► storage.set_item("cart-history", json)                       │
//! │       └──► on_change(&entries)                                          │
//! │                                                                         │
//! │  restore_state(id) ──► Some(copy of the snapshot)                       │
//! │                              │                                          │
//! │                              ▼                                          │
//! │                   store.replay(state.items())   (caller's choice)       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The in-memory list is authoritative. Persistence failures are logged and
//! reported, never rolled back.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::{debug, warn};

use cartkit_core::validation::{validate_max_entries, validate_storage_key};
use cartkit_core::{
    CartState, Clock, HistoryEntry, SystemClock, DEFAULT_HISTORY_KEY, DEFAULT_MAX_HISTORY_ENTRIES,
};

use crate::backend::{ErrorCallback, KeyValueStorage};
use crate::error::{StoreError, StoreResult};

/// Receives the full list after every change, newest first.
pub type HistoryCallback = Arc<dyn Fn(&[HistoryEntry]) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryConfig {
    /// Default: 10
    pub max_entries: usize,

    /// Default: "cart-history"
    pub storage_key: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        HistoryConfig {
            max_entries: DEFAULT_MAX_HISTORY_ENTRIES,
            storage_key: DEFAULT_HISTORY_KEY.to_string(),
        }
    }
}

/// Snapshot history for one cart.
pub struct HistoryEngine {
    config: HistoryConfig,
    storage: Option<Arc<dyn KeyValueStorage>>,
    entries: Mutex<Vec<HistoryEntry>>,
    on_change: Option<HistoryCallback>,
    on_error: Option<ErrorCallback>,
    clock: Arc<dyn Clock>,
}

impl HistoryEngine {
    /// Creates the engine and loads any persisted list from `storage`.
    pub fn new(
        config: HistoryConfig,
        storage: Option<Arc<dyn KeyValueStorage>>,
    ) -> StoreResult<Self> {
        validate_max_entries(config.max_entries)?;
        validate_storage_key(&config.storage_key)?;

        let mut entries = match &storage {
            Some(storage) => load_entries(storage.as_ref(), &config.storage_key),
            None => Vec::new(),
        };
        entries.truncate(config.max_entries);

        debug!(
            key = %config.storage_key,
            entries = entries.len(),
            persistent = storage.is_some(),
            "History engine created"
        );

        Ok(HistoryEngine {
            config,
            storage,
            entries: Mutex::new(entries),
            on_change: None,
            on_error: None,
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_on_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(&[HistoryEntry]) + Send + Sync + 'static,
    {
        self.on_change = Some(Arc::new(callback));
        self
    }

    pub fn with_on_error(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Records a copy of `state` as the newest entry.
    pub fn add_state(
        &self,
        state: &CartState,
        label: Option<String>,
        metadata: Option<Value>,
    ) -> HistoryEntry {
        let entry = HistoryEntry::new(state.clone(), self.clock.now(), label, metadata);

        let (snapshot, failure) = {
            let mut entries = self.lock_entries();
            entries.insert(0, entry.clone());
            if entries.len() > self.config.max_entries {
                let evicted = entries.len() - self.config.max_entries;
                entries.truncate(self.config.max_entries);
                debug!(evicted, "Oldest history entries evicted");
            }
            (entries.clone(), self.persist(&entries))
        };

        debug!(entry_id = %entry.id, items = state.len(), "History entry added");
        self.finish(snapshot, failure);
        entry
    }

    /// All entries, newest first.
    pub fn get_entries(&self) -> Vec<HistoryEntry> {
        self.lock_entries().clone()
    }

    pub fn get_entry(&self, id: &str) -> Option<HistoryEntry> {
        self.lock_entries().iter().find(|e| e.id == id).cloned()
    }

    /// A copy of the snapshot stored under `id`.
    ///
    /// The live cart is untouched; apply it with `store.replay(state.items())`.
    pub fn restore_state(&self, id: &str) -> Option<CartState> {
        let state = self.get_entry(id).map(|entry| entry.state);
        if state.is_none() {
            debug!(entry_id = id, "restore_state: no such entry");
        }
        state
    }

    /// Returns `true` if an entry was removed.
    pub fn remove_entry(&self, id: &str) -> bool {
        let (snapshot, failure) = {
            let mut entries = self.lock_entries();
            let before = entries.len();
            entries.retain(|e| e.id != id);
            if entries.len() == before {
                return false;
            }
            (entries.clone(), self.persist(&entries))
        };

        debug!(entry_id = id, "History entry removed");
        self.finish(snapshot, failure);
        true
    }

    pub fn clear(&self) {
        let failure = {
            let mut entries = self.lock_entries();
            entries.clear();
            match &self.storage {
                Some(storage) => storage.remove_item(&self.config.storage_key).err(),
                None => None,
            }
        };

        debug!("History cleared");
        self.finish(Vec::new(), failure);
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    fn lock_entries(&self) -> MutexGuard<'_, Vec<HistoryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, entries: &[HistoryEntry]) -> Option<StoreError> {
        let storage = self.storage.as_ref()?;
        let result = serde_json::to_string(entries)
            .map_err(StoreError::from)
            .and_then(|json| storage.set_item(&self.config.storage_key, &json));
        result.err()
    }

    fn finish(&self, snapshot: Vec<HistoryEntry>, failure: Option<StoreError>) {
        if let Some(err) = failure {
            warn!(key = %self.config.storage_key, error = %err, "History persistence failed");
            if let Some(on_error) = &self.on_error {
                on_error(&err);
            }
        }
        if let Some(on_change) = &self.on_change {
            on_change(&snapshot);
        }
    }
}

impl std::fmt::Debug for HistoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryEngine")
            .field("config", &self.config)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

fn load_entries(storage: &dyn KeyValueStorage, key: &str) -> Vec<HistoryEntry> {
    let raw = match storage.get_item(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Vec::new(),
        Err(e) => {
            warn!(key, error = %e, "Could not read history, starting empty");
            return Vec::new();
        }
    };

    serde_json::from_str(&raw).unwrap_or_else(|e| {
        warn!(key, error = %e, "History record is unreadable, starting empty");
        Vec::new()
    })
}
