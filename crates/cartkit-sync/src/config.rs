//! # Sync Configuration
//!
//! The `[sync]` section of `cartkit.toml`.
//!
//! ## Configuration File Format
//! ```toml
//! [storage]              # read by cartkit-store
//! kind = "file"
//!
//! [sync]
//! channel_name = "cart-sync"
//! origin = "https://shop.example.com"
//! storage_fallback = true
//! poll_interval_ms = 250
//! ```
//!
//! ## Environment Overrides
//! | Variable                 | Field              |
//! |--------------------------|--------------------|
//! | `CARTKIT_SYNC_CHANNEL`   | `channel_name`     |
//! | `CARTKIT_SYNC_ORIGIN`    | `origin`           |
//! | `CARTKIT_SYNC_POLL_MS`   | `poll_interval_ms` |
//! | `CARTKIT_SYNC_FALLBACK`  | `storage_fallback` |

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use cartkit_core::DEFAULT_CHANNEL_NAME;

use crate::error::{SyncError, SyncResult};

/// Origin used when none is configured.
pub const DEFAULT_ORIGIN: &str = "default";

/// Cross-context sync settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Broadcast channel shared by every context of the origin.
    /// Default: "cart-sync"
    #[serde(default = "default_channel_name")]
    pub channel_name: String,

    /// Contexts only see channels opened under the same origin.
    /// Default: "default"
    #[serde(default = "default_origin")]
    pub origin: String,

    /// Also watch the persisted record for changes made by other contexts.
    /// Default: false
    #[serde(default)]
    pub storage_fallback: bool,

    /// Marker polling interval for the fallback watcher.
    /// Default: 250
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_channel_name() -> String {
    DEFAULT_CHANNEL_NAME.to_string()
}

fn default_origin() -> String {
    DEFAULT_ORIGIN.to_string()
}

fn default_poll_interval() -> u64 {
    250
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            channel_name: default_channel_name(),
            origin: default_origin(),
            storage_fallback: false,
            poll_interval_ms: default_poll_interval(),
        }
    }
}

/// `cartkit.toml` as seen by this crate; other sections are ignored.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    sync: SyncConfig,
}

impl SyncConfig {
    /// Loads configuration from file, environment, and defaults.
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading sync config from file");
                let contents = std::fs::read_to_string(&path)?;
                let file: ConfigFile = toml::from_str(&contents)?;
                config = file.sync;
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
            warn!("Failed to load sync config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Writes the `[sync]` section, keeping every other section of the file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        let mut document = read_table(&path)?;
        document.insert("sync".to_string(), toml::Value::try_from(self)?);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;
        }

        let contents = toml::to_string_pretty(&document)?;
        std::fs::write(&path, contents).map_err(|e| SyncError::ConfigSaveFailed(e.to_string()))?;

        info!(?path, "Sync config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        if self.channel_name.trim().is_empty() {
            return Err(SyncError::InvalidConfig("channel_name cannot be empty".into()));
        }

        if self.origin.trim().is_empty() {
            return Err(SyncError::InvalidConfig("origin cannot be empty".into()));
        }

        if self.poll_interval_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "poll_interval_ms must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn channel_name(mut self, name: impl Into<String>) -> Self {
        self.channel_name = name.into();
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Enables the storage fallback watcher with the given interval.
    pub fn storage_fallback(mut self, poll_interval: Duration) -> Self {
        self.storage_fallback = true;
        self.poll_interval_ms = poll_interval.as_millis().max(1) as u64;
        self
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(channel) = lookup("CARTKIT_SYNC_CHANNEL") {
            debug!(channel = %channel, "Overriding channel name from environment");
            self.channel_name = channel;
        }

        if let Some(origin) = lookup("CARTKIT_SYNC_ORIGIN") {
            self.origin = origin;
        }

        if let Some(ms) = lookup("CARTKIT_SYNC_POLL_MS") {
            match ms.parse::<u64>() {
                Ok(ms) => self.poll_interval_ms = ms,
                Err(_) => warn!(value = %ms, "Ignoring non-numeric CARTKIT_SYNC_POLL_MS"),
            }
        }

        if let Some(flag) = lookup("CARTKIT_SYNC_FALLBACK") {
            match flag.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.storage_fallback = true,
                "0" | "false" | "no" | "off" => self.storage_fallback = false,
                _ => warn!(value = %flag, "Ignoring unrecognised CARTKIT_SYNC_FALLBACK"),
            }
        }
    }

    /// Returns the default config file path.
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "cartkit", "cartkit")
            .map(|dirs| dirs.config_dir().join("cartkit.toml"))
    }
}

fn read_table(path: &Path) -> SyncResult<toml::Table> {
    if !path.exists() {
        return Ok(toml::Table::new());
    }
    let contents = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.channel_name, "cart-sync");
        assert_eq!(config.origin, "default");
        assert!(!config.storage_fallback);
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = SyncConfig::default();

        config.channel_name = "".into();
        assert!(config.validate().is_err());
        config.channel_name = "cart-sync".into();

        config.poll_interval_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CARTKIT_SYNC_CHANNEL", "shop-42"),
            ("CARTKIT_SYNC_ORIGIN", "https://shop.example.com"),
            ("CARTKIT_SYNC_POLL_MS", "50"),
            ("CARTKIT_SYNC_FALLBACK", "TRUE"),
        ]
        .into_iter()
        .collect();

        let mut config = SyncConfig::default();
        config.apply_overrides_from(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.channel_name, "shop-42");
        assert_eq!(config.origin, "https://shop.example.com");
        assert_eq!(config.poll_interval_ms, 50);
        assert!(config.storage_fallback);
    }

    #[test]
    fn test_bad_env_values_are_ignored() {
        let mut config = SyncConfig::default();
        config.apply_overrides_from(|name| match name {
            "CARTKIT_SYNC_POLL_MS" => Some("soon".into()),
            "CARTKIT_SYNC_FALLBACK" => Some("maybe".into()),
            _ => None,
        });
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn test_load_reads_sync_section_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cartkit.toml");
        std::fs::write(
            &path,
            "[storage]\nkind = \"file\"\n\n[sync]\nchannel_name = \"shop\"\nstorage_fallback = true\n",
        )
        .unwrap();

        let config = SyncConfig::load(Some(path)).unwrap();
        assert_eq!(config.channel_name, "shop");
        assert!(config.storage_fallback);
        assert_eq!(config.origin, "default");
    }

    #[test]
    fn test_save_keeps_other_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cartkit.toml");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "[storage]\nkind = \"session\"\n").unwrap();

        let config = SyncConfig::default()
            .channel_name("shop")
            .storage_fallback(Duration::from_millis(40));
        config.save(Some(path.clone())).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("[storage]"));
        assert!(contents.contains("kind = \"session\""));

        assert_eq!(SyncConfig::load(Some(path)).unwrap(), config);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::load(Some(dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.channel_name, "cart-sync");
    }
}
