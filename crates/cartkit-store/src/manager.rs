//! # Cart Manager
//!
//! The facade UI code talks to: picks a backend, forwards cart operations
//! and turns every failure into an [`ErrorReport`].
//!
//! ## Backend Selection
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  ManagerOptions                                                         │
//! │       │                                                                 │
//! │       ├── backend = Some(custom) ──────────────► custom                 │
//! │       │                                                                 │
//! │       ├── persist = true ──► FileStorage(storage_dir or data dir)       │
//! │       │                      └──► StorageBackend(storage_key)           │
//! │       │                                                                 │
//! │       └── otherwise ───────────────────────────► MemoryBackend          │
//! │                                                                         │
//! │  Failure path:                                                          │
//! │  add_item(p, 0) ──► StoreError ──► ErrorReport ──► on_error + warn!     │
//! │                          │                                              │
//! │                          └──────────────► returned to the caller        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, warn};

use cartkit_core::{CartState, Clock, Product, SystemClock, DEFAULT_STORAGE_KEY};

use crate::backend::{
    Backend, BackendKind, ErrorCallback, FileStorage, MemoryBackend, RemoteBackend,
    SessionStorage, SqliteBackend, StorageBackend,
};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::report::ErrorReport;
use crate::store::{CartStore, StoreOptions, Subscription};

/// Receives a report for every failed manager operation.
pub type ReportCallback = Arc<dyn Fn(&ErrorReport) + Send + Sync>;

// =============================================================================
// Options
// =============================================================================

/// How a [`CartManager`] should persist the cart.
#[derive(Clone)]
pub struct ManagerOptions {
    /// Takes priority over everything else.
    pub backend: Option<Arc<dyn Backend>>,

    /// Persist to files when no custom backend is given. Default: false
    pub persist: bool,

    /// Default: "cart-state"
    pub storage_key: String,

    /// Default: platform data directory
    pub storage_dir: Option<PathBuf>,

    pub on_error: Option<ReportCallback>,

    /// Fixed at construction; `reconfigure` does not change it.
    pub clock: Arc<dyn Clock>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        ManagerOptions {
            backend: None,
            persist: false,
            storage_key: DEFAULT_STORAGE_KEY.to_string(),
            storage_dir: None,
            on_error: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl ManagerOptions {
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ErrorReport) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn select_backend(&self) -> StoreResult<Arc<dyn Backend>> {
        if let Some(backend) = &self.backend {
            return Ok(Arc::clone(backend));
        }
        if self.persist {
            let storage = match &self.storage_dir {
                Some(dir) => FileStorage::new(dir)?,
                None => FileStorage::open_default()?,
            };
            return Ok(Arc::new(StorageBackend::file(storage, self.storage_key.clone())?));
        }
        Ok(Arc::new(MemoryBackend::new()))
    }
}

// =============================================================================
// Reporter
// =============================================================================

/// Late-bound report callback shared with the store's persistence hook.
#[derive(Clone, Default)]
struct Reporter {
    callback: Arc<RwLock<Option<ReportCallback>>>,
}

impl Reporter {
    fn set(&self, callback: Option<ReportCallback>) {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    fn report(&self, operation: &str, err: &StoreError) {
        let report = ErrorReport::new(operation, err);
        warn!(code = ?report.code, operation, error = %err, "Cart operation failed");

        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(&report);
        }
    }

    fn persistence_hook(&self) -> ErrorCallback {
        let reporter = self.clone();
        Arc::new(move |err: &StoreError| reporter.report("persist", err))
    }
}

// =============================================================================
// Cart Manager
// =============================================================================

/// Owns one [`CartStore`] and reports every failure.
#[derive(Clone)]
pub struct CartManager {
    store: CartStore,
    reporter: Reporter,
}

impl CartManager {
    pub fn new(options: ManagerOptions) -> StoreResult<Self> {
        let reporter = Reporter::default();
        reporter.set(options.on_error.clone());

        let backend = options
            .select_backend()
            .inspect_err(|e| reporter.report("new", e))?;

        let store = CartStore::with_options(
            StoreOptions::new(backend)
                .with_clock(Arc::clone(&options.clock))
                .on_persistence_error(reporter.persistence_hook()),
        );

        Ok(CartManager { store, reporter })
    }

    /// Builds the backend named by `config.storage.kind`.
    ///
    /// SQLite is initialized and a remote cart is fetched before the store
    /// is created, so the store starts from the persisted cart.
    pub async fn from_config(config: &StoreConfig) -> StoreResult<Self> {
        config.validate()?;
        let key = config.storage.key.clone();

        let backend: Arc<dyn Backend> = match config.storage.kind {
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
            BackendKind::File => Arc::new(StorageBackend::file(config.file_storage()?, key)?),
            BackendKind::Session => Arc::new(StorageBackend::session(
                SessionStorage::new().with_quota(config.storage.quota_bytes),
                key,
            )?),
            BackendKind::Sqlite => {
                let sqlite = SqliteBackend::new(config.sqlite_config()?)?;
                sqlite.initialize().await?;
                Arc::new(sqlite)
            }
            BackendKind::Remote => {
                let remote = RemoteBackend::new(config.remote_config()?)?;
                if let Err(e) = remote.load_async().await {
                    warn!(error = %e, "Remote cart unavailable at startup, starting empty");
                }
                Arc::new(remote)
            }
        };

        info!(kind = %config.storage.kind, "Cart manager configured");
        Self::new(ManagerOptions::default().backend(backend))
    }

    // =========================================================================
    // Forwarded Operations
    // =========================================================================

    pub fn get_state(&self) -> CartState {
        self.store.get_state()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&CartState) + Send + Sync + 'static,
    {
        self.store.subscribe(callback)
    }

    /// Reports, then returns, any validation error.
    pub fn add_item(&self, product: &Product, quantity: i64) -> StoreResult<()> {
        self.store
            .add_item(product, quantity)
            .inspect_err(|e| self.reporter.report("addItem", e))
    }

    pub fn remove_item(&self, item_id: &str) {
        self.store.remove_item(item_id);
    }

    pub fn update_quantity(&self, item_id: &str, quantity: i64) {
        self.store.update_quantity(item_id, quantity);
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Swaps backend and error callback in place. Subscriptions survive.
    pub fn reconfigure(&self, options: ManagerOptions) -> StoreResult<()> {
        self.reporter.set(options.on_error.clone());

        let backend = options
            .select_backend()
            .inspect_err(|e| self.reporter.report("reconfigure", e))?;
        self.store.set_backend(backend);

        info!(backend = %self.store.backend_kind(), "Cart manager reconfigured");
        Ok(())
    }

    pub fn set_error_callback(&self, callback: Option<ReportCallback>) {
        self.reporter.set(callback);
    }

    /// The underlying store, for the sync engine.
    pub fn store(&self) -> CartStore {
        self.store.clone()
    }
}

impl std::fmt::Debug for CartManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CartManager")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
