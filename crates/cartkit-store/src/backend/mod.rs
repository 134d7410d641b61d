//! # Persistence Backends
//!
//! Where a cart lives between sessions.
//!
//! ## Backend Family
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Backend trait                                   │
//! │        save(&CartState) / load() / clear() / kind()                     │
//! │                              │                                          │
//! │   ┌──────────────┬───────────┼──────────────┬────────────────────┐      │
//! │   ▼              ▼           ▼              ▼                    ▼      │
//! │ Memory      StorageBackend over            SqliteBackend   RemoteBackend│
//! │ (default)   KeyValueStorage                (sqlx, async)   (reqwest)    │
//! │             ├── FileStorage  (durable)          │               │       │
//! │             └── SessionStorage (process)        └──── deferred ─┘       │
//! │                                                  AsyncCache +           │
//! │                                                  ordered WriteQueue     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Synchronous Façade
//! The store calls `save` inside a mutation and must never wait on I/O. The
//! two asynchronous backends therefore answer from a local cache and push
//! the actual write onto a single background task. Their failures arrive
//! later, through the error callback attached with
//! [`Backend::set_error_callback`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use cartkit_core::CartState;

use crate::error::{StoreError, StoreResult};

pub mod deferred;
pub mod memory;
pub mod remote;
pub mod sqlite;
pub mod storage;

pub use deferred::{AsyncCache, ErrorSlot, RecordSink, WriteQueue};
pub use memory::MemoryBackend;
pub use remote::{RemoteBackend, RemoteBackendBuilder, RemoteConfig, SaveMethod};
pub use sqlite::{SqliteBackend, SqliteConfig};
pub use storage::{FileStorage, KeyValueStorage, SessionStorage, StorageBackend};

/// Callback receiving persistence failures that could not be returned.
pub type ErrorCallback = Arc<dyn Fn(&StoreError) + Send + Sync>;

// =============================================================================
// Backend Kind
// =============================================================================

/// Which family a backend belongs to. Also the `[storage] kind` config value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Memory,
    File,
    Session,
    Sqlite,
    Remote,
}

impl BackendKind {
    /// Asynchronous backends need a runtime and answer `load()` from a cache.
    pub fn is_async(&self) -> bool {
        matches!(self, BackendKind::Sqlite | BackendKind::Remote)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Memory => write!(f, "memory"),
            BackendKind::File => write!(f, "file"),
            BackendKind::Session => write!(f, "session"),
            BackendKind::Sqlite => write!(f, "sqlite"),
            BackendKind::Remote => write!(f, "remote"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "none" => Ok(BackendKind::Memory),
            "file" | "local" => Ok(BackendKind::File),
            "session" => Ok(BackendKind::Session),
            "sqlite" | "database" => Ok(BackendKind::Sqlite),
            "remote" | "http" => Ok(BackendKind::Remote),
            other => Err(StoreError::InvalidConfig(format!(
                "Unknown storage kind: '{}'. Valid options: memory, file, session, sqlite, remote",
                other
            ))),
        }
    }
}

// =============================================================================
// Backend Trait
// =============================================================================

/// A place to persist the whole cart state.
///
/// ## Contract
/// - `save(s)` followed by `load()` yields `Some(s)`
/// - `load()` yields `None` when nothing was ever saved (or after `clear()`)
/// - Errors are returned, never swallowed; the store decides what to do
pub trait Backend: Send + Sync {
    fn save(&self, state: &CartState) -> StoreResult<()>;

    fn load(&self) -> StoreResult<Option<CartState>>;

    fn clear(&self) -> StoreResult<()>;

    fn kind(&self) -> BackendKind;

    /// Receives failures of writes that complete after `save`/`clear` returned.
    ///
    /// Synchronous backends have none, so the default ignores the callback.
    fn set_error_callback(&self, _callback: Option<ErrorCallback>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("memory".parse::<BackendKind>().unwrap(), BackendKind::Memory);
        assert_eq!("FILE".parse::<BackendKind>().unwrap(), BackendKind::File);
        assert_eq!("sqlite".parse::<BackendKind>().unwrap(), BackendKind::Sqlite);
        assert!("redis".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_backend_kind_async() {
        assert!(BackendKind::Sqlite.is_async());
        assert!(BackendKind::Remote.is_async());
        assert!(!BackendKind::File.is_async());
        assert_eq!(BackendKind::Session.to_string(), "session");
    }
}
