//! # Store Configuration
//!
//! Backend selection, history bounds and remote API settings.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     CARTKIT_STORAGE_KIND=file                                          │
//! │     CARTKIT_STORAGE_KEY=shop-42-cart                                   │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     ~/.config/cartkit/cartkit.toml (Linux)                             │
//! │     ~/Library/Application Support/dev.cartkit.cartkit/cartkit.toml     │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     memory backend, key "cart-state", 10 history entries              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # cartkit.toml
//! [storage]
//! kind = "file"          # memory | file | session | sqlite | remote
//! key = "cart-state"
//! directory = "/var/lib/shop/cart"
//! quota_bytes = 5242880
//!
//! [history]
//! max_entries = 10
//! key = "cart-history"
//!
//! [remote]
//! endpoint = "https://api.example.com/carts"
//! cart_id = "42"
//! save_method = "PUT"
//! timeout_secs = 10
//!
//! [sync]                 # read by cartkit-sync, ignored here
//! channel_name = "cart-sync"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use cartkit_core::validation::{validate_max_entries, validate_storage_key};
use cartkit_core::{
    DEFAULT_HISTORY_KEY, DEFAULT_MAX_HISTORY_ENTRIES, DEFAULT_STORAGE_KEY,
    DEFAULT_STORAGE_QUOTA_BYTES,
};

use crate::backend::{BackendKind, FileStorage, RemoteConfig, SaveMethod, SqliteConfig};
use crate::error::{StoreError, StoreResult};
use crate::history::HistoryConfig;

// =============================================================================
// Storage Settings
// =============================================================================

/// Where the cart is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub kind: BackendKind,

    /// Record key. Default: "cart-state"
    #[serde(default = "default_storage_key")]
    pub key: String,

    /// Directory for the `file` kind. Default: platform data directory
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Byte quota for `file` and `session`. Default: 5 MiB
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: u64,

    /// Database file for the `sqlite` kind. Default: `<data dir>/cart.db`
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

fn default_storage_key() -> String {
    DEFAULT_STORAGE_KEY.to_string()
}

fn default_quota_bytes() -> u64 {
    DEFAULT_STORAGE_QUOTA_BYTES
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings {
            kind: BackendKind::default(),
            key: default_storage_key(),
            directory: None,
            quota_bytes: default_quota_bytes(),
            database_path: None,
        }
    }
}

// =============================================================================
// History Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySettings {
    /// Snapshots kept, newest first. Default: 10
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Storage key of the snapshot list. Default: "cart-history"
    #[serde(default = "default_history_key")]
    pub key: String,
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_HISTORY_ENTRIES
}

fn default_history_key() -> String {
    DEFAULT_HISTORY_KEY.to_string()
}

impl Default for HistorySettings {
    fn default() -> Self {
        HistorySettings {
            max_entries: default_max_entries(),
            key: default_history_key(),
        }
    }
}

// =============================================================================
// Remote Settings
// =============================================================================

/// Cart API settings, used when `storage.kind = "remote"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSettings {
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub cart_id: Option<String>,

    #[serde(default)]
    pub save_method: SaveMethod,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    10
}

impl Default for RemoteSettings {
    fn default() -> Self {
        RemoteSettings {
            endpoint: None,
            cart_id: None,
            save_method: SaveMethod::default(),
            timeout_secs: default_timeout(),
        }
    }
}

// =============================================================================
// Store Config
// =============================================================================

/// Everything `cartkit-store` reads from `cartkit.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub history: HistorySettings,

    #[serde(default)]
    pub remote: RemoteSettings,
}

impl StoreConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (cartkit.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> StoreResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading store config from file");
                let contents = std::fs::read_to_string(&path)
                    .map_err(|e| StoreError::ConfigLoadFailed(e.to_string()))?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<PathBuf>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load store config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> StoreResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| StoreError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(&path, contents).map_err(|e| StoreError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Store config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> StoreResult<()> {
        validate_storage_key(&self.storage.key)?;
        validate_storage_key(&self.history.key)?;
        validate_max_entries(self.history.max_entries)?;

        if self.storage.kind == BackendKind::Remote {
            let endpoint = self.remote.endpoint.as_deref().ok_or_else(|| {
                StoreError::InvalidConfig("remote storage needs [remote] endpoint".into())
            })?;
            RemoteConfig::new(endpoint)?;
        }

        if self.remote.timeout_secs == 0 {
            return Err(StoreError::InvalidConfig(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Applies `CARTKIT_*` overrides read through `lookup`.
    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(kind) = lookup("CARTKIT_STORAGE_KIND") {
            match kind.parse() {
                Ok(parsed) => {
                    debug!(kind = %kind, "Overriding storage kind from environment");
                    self.storage.kind = parsed;
                }
                Err(_) => warn!(kind = %kind, "Unknown storage kind in environment"),
            }
        }

        if let Some(key) = lookup("CARTKIT_STORAGE_KEY") {
            debug!(key = %key, "Overriding storage key from environment");
            self.storage.key = key;
        }

        if let Some(dir) = lookup("CARTKIT_STORAGE_DIR") {
            self.storage.directory = Some(PathBuf::from(dir));
        }

        if let Some(max) = lookup("CARTKIT_HISTORY_MAX") {
            if let Ok(m) = max.parse::<usize>() {
                self.history.max_entries = m;
            }
        }

        if let Some(endpoint) = lookup("CARTKIT_REMOTE_ENDPOINT") {
            debug!(endpoint = %endpoint, "Overriding remote endpoint from environment");
            self.remote.endpoint = Some(endpoint);
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "cartkit", "cartkit")
            .map(|dirs| dirs.config_dir().join("cartkit.toml"))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    pub fn history_config(&self) -> HistoryConfig {
        HistoryConfig {
            max_entries: self.history.max_entries,
            storage_key: self.history.key.clone(),
        }
    }

    /// Storage directory for the `file` kind, with the configured quota.
    pub fn file_storage(&self) -> StoreResult<FileStorage> {
        let storage = match &self.storage.directory {
            Some(dir) => FileStorage::new(dir)?,
            None => FileStorage::open_default()?,
        };
        Ok(storage.with_quota(self.storage.quota_bytes))
    }

    pub fn sqlite_config(&self) -> StoreResult<SqliteConfig> {
        let path = match &self.storage.database_path {
            Some(path) => path.clone(),
            None => directories::ProjectDirs::from("dev", "cartkit", "cartkit")
                .map(|dirs| dirs.data_dir().join("cart.db"))
                .ok_or_else(|| {
                    StoreError::InvalidConfig("Could not determine app data directory".into())
                })?,
        };
        Ok(SqliteConfig::new(path).key(self.storage.key.clone()))
    }

    pub fn remote_config(&self) -> StoreResult<RemoteConfig> {
        let endpoint = self
            .remote
            .endpoint
            .as_deref()
            .ok_or_else(|| StoreError::InvalidConfig("[remote] endpoint is not set".into()))?;

        let mut config = RemoteConfig::new(endpoint)?
            .save_method(self.remote.save_method)
            .timeout(Duration::from_secs(self.remote.timeout_secs));
        if let Some(id) = &self.remote.cart_id {
            config = config.cart_id(id.clone());
        }
        Ok(config)
    }
}
