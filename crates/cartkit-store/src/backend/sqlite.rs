//! # SQLite Backend
//!
//! Durable asynchronous backend on sqlx SQLite.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  SqliteBackend::new(config)      ← needs a tokio runtime, no I/O yet   │
//! │       │                                                                 │
//! │       │  save()/clear() here → NotInitialized, load() → None            │
//! │       ▼                                                                 │
//! │  backend.initialize().await                                            │
//! │       ├── open pool (WAL, synchronous=NORMAL, create if missing)        │
//! │       ├── run embedded migrations                                       │
//! │       ├── read the cart record into the cache                           │
//! │       └── start the background writer                                   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  CartStore::new(Arc::new(backend))  ← load() now serves the record     │
//! │                                                                         │
//! │  save(s) ──► cache = s ──► writer: INSERT ... ON CONFLICT DO UPDATE     │
//! │  clear() ──► cache = ∅ ──► writer: DELETE                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Table
//! `cart_records(key PRIMARY KEY, payload, updated_at)`: one row per cart key.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use cartkit_core::validation::validate_storage_key;
use cartkit_core::{CartState, DEFAULT_STORAGE_KEY};

use super::deferred::{current_runtime, lock_cache, SharedCache};
use super::{AsyncCache, Backend, BackendKind, ErrorCallback, ErrorSlot, RecordSink, WriteQueue};
use crate::error::{StoreError, StoreResult};
use crate::migrations;

const IN_MEMORY: &str = ":memory:";

// =============================================================================
// Configuration
// =============================================================================

/// SQLite backend configuration.
///
/// ## Example
/// ```rust,ignore
/// let config = SqliteConfig::new("/path/to/cart.db")
///     .key("cart-state")
///     .max_connections(2);
/// ```
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Path to the SQLite database file. Created if missing.
    pub database_path: PathBuf,

    /// Row key the cart is stored under.
    pub key: String,

    /// Default: 2 (one writer task plus async reads)
    pub max_connections: u32,

    /// Default: 30 seconds
    pub connect_timeout: Duration,

    /// Default: true
    pub run_migrations: bool,
}

impl SqliteConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SqliteConfig {
            database_path: path.into(),
            key: DEFAULT_STORAGE_KEY.to_string(),
            max_connections: 2,
            connect_timeout: Duration::from_secs(30),
            run_migrations: true,
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// In-memory database (for testing). Single connection, never recycled.
    pub fn in_memory() -> Self {
        SqliteConfig {
            database_path: PathBuf::from(IN_MEMORY),
            max_connections: 1,
            connect_timeout: Duration::from_secs(5),
            ..SqliteConfig::new(IN_MEMORY)
        }
    }

    fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == IN_MEMORY
    }
}

// =============================================================================
// Record Sink
// =============================================================================

struct SqliteSink {
    pool: SqlitePool,
    key: String,
}

#[async_trait]
impl RecordSink for SqliteSink {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn write(&self, state: &CartState) -> StoreResult<()> {
        let payload = serde_json::to_string(state)?;
        sqlx::query(
            r#"
            INSERT INTO cart_records (key, payload, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.key)
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!(key = %self.key, items = state.len(), "Cart record upserted");
        Ok(())
    }

    async fn erase(&self) -> StoreResult<()> {
        sqlx::query("DELETE FROM cart_records WHERE key = ?1")
            .bind(&self.key)
            .execute(&self.pool)
            .await?;

        debug!(key = %self.key, "Cart record deleted");
        Ok(())
    }
}

async fn fetch_record(pool: &SqlitePool, key: &str) -> StoreResult<Option<CartState>> {
    let payload: Option<String> =
        sqlx::query_scalar("SELECT payload FROM cart_records WHERE key = ?1")
            .bind(key)
            .fetch_optional(pool)
            .await?;

    payload
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(StoreError::from)
}

// =============================================================================
// SQLite Backend
// =============================================================================

struct SqliteInner {
    pool: SqlitePool,
    queue: WriteQueue,
}

/// Durable asynchronous backend. Call [`SqliteBackend::initialize`] first.
pub struct SqliteBackend {
    config: SqliteConfig,
    runtime: Handle,
    cache: SharedCache,
    errors: ErrorSlot,
    inner: OnceLock<SqliteInner>,
}

impl SqliteBackend {
    /// Creates an uninitialized backend. Must be called inside a tokio runtime.
    pub fn new(config: SqliteConfig) -> StoreResult<Self> {
        validate_storage_key(&config.key)?;
        let runtime = current_runtime()?;
        Ok(SqliteBackend {
            config,
            runtime,
            cache: Arc::new(Mutex::new(AsyncCache::default())),
            errors: ErrorSlot::default(),
            inner: OnceLock::new(),
        })
    }

    /// Opens the database, runs migrations and loads the cart into the cache.
    ///
    /// Calling it again after success is a no-op.
    pub async fn initialize(&self) -> StoreResult<()> {
        if self.is_initialized() {
            return Ok(());
        }

        info!(
            path = %self.config.database_path.display(),
            "Initializing SQLite cart backend"
        );

        let pool = self.connect().await?;
        if self.config.run_migrations {
            migrations::run_migrations(&pool).await?;
        }

        let record = fetch_record(&pool, &self.config.key).await?;
        lock_cache(&self.cache).fill(record);

        let sink = Arc::new(SqliteSink {
            pool: pool.clone(),
            key: self.config.key.clone(),
        });
        let queue = WriteQueue::start(&self.runtime, sink, self.errors.clone());

        if let Err(extra) = self.inner.set(SqliteInner { pool, queue }) {
            // Lost a concurrent initialize() race; keep the winner's pool.
            extra.pool.close().await;
        }

        info!(key = %self.config.key, "SQLite cart backend initialized");
        Ok(())
    }

    async fn connect(&self) -> StoreResult<SqlitePool> {
        let base = if self.config.is_in_memory() {
            SqliteConnectOptions::new().in_memory(true)
        } else {
            SqliteConnectOptions::new()
                .filename(&self.config.database_path)
                .create_if_missing(true)
        };
        let options = base
            // WAL mode: readers don't block the background writer
            .journal_mode(SqliteJournalMode::Wal)
            // NORMAL synchronous: may lose the last write on power loss, never corrupts
            .synchronous(SqliteSynchronous::Normal);

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(self.config.connect_timeout);
        if self.config.is_in_memory() {
            // The database lives only as long as its single connection.
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options.connect_with(options).await?;
        debug!(max_connections = self.config.max_connections, "SQLite pool created");
        Ok(pool)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.get().is_some()
    }

    fn inner(&self) -> StoreResult<&SqliteInner> {
        self.inner.get().ok_or(StoreError::NotInitialized("sqlite"))
    }

    /// Reads the record from the database, after pending writes land.
    pub async fn load_async(&self) -> StoreResult<Option<CartState>> {
        let inner = self.inner()?;
        inner.queue.flush().await?;
        let record = fetch_record(&inner.pool, &self.config.key).await?;
        lock_cache(&self.cache).fill(record.clone());
        Ok(record)
    }

    /// Waits for every queued write to be applied.
    pub async fn flush(&self) -> StoreResult<()> {
        self.inner()?.queue.flush().await
    }

    /// Flushes pending writes and closes the pool.
    pub async fn close(&self) {
        if let Some(inner) = self.inner.get() {
            if let Err(e) = inner.queue.flush().await {
                warn!(error = %e, "Pending cart writes could not be flushed before close");
            }
            info!("Closing SQLite cart backend");
            inner.pool.close().await;
        }
    }

    /// `true` if the database answers a trivial query.
    pub async fn health_check(&self) -> bool {
        match self.inner.get() {
            Some(inner) => sqlx::query("SELECT 1").execute(&inner.pool).await.is_ok(),
            None => false,
        }
    }

    pub fn pool(&self) -> Option<&SqlitePool> {
        self.inner.get().map(|inner| &inner.pool)
    }
}

impl Backend for SqliteBackend {
    fn save(&self, state: &CartState) -> StoreResult<()> {
        let inner = self.inner()?;
        lock_cache(&self.cache).store(state.clone());
        inner.queue.enqueue_save(state.clone())
    }

    fn load(&self) -> StoreResult<Option<CartState>> {
        Ok(lock_cache(&self.cache).value())
    }

    fn clear(&self) -> StoreResult<()> {
        let inner = self.inner()?;
        lock_cache(&self.cache).clear();
        inner.queue.enqueue_clear()
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn set_error_callback(&self, callback: Option<ErrorCallback>) {
        self.errors.set(callback);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
