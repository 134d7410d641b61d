//! # Store Error Types
//!
//! Error types for cart mutations, persistence backends and configuration.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  add_item(p, 0) ──► StoreError::InvalidQuantity ──► returned to caller │
//! │                                                                         │
//! │  backend.save() fails                                                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  StoreError (this module) ← Adds context and categorization            │
//! │       │                                                                 │
//! │       ├──► tracing::warn!                                              │
//! │       ├──► persistence error callback                                  │
//! │       ▼                                                                 │
//! │  ErrorReport (report.rs) ← Serialized for the UI                       │
//! │                                                                         │
//! │  The in-memory cart is NEVER rolled back by a persistence failure.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use cartkit_core::{CoreError, ValidationError};
use thiserror::Error;

/// Store operation errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    // =========================================================================
    // Caller Errors
    // =========================================================================
    /// Quantity was zero or negative on `add_item`.
    #[error("Invalid quantity {quantity}: must be at least 1")]
    InvalidQuantity { quantity: i64 },

    /// Product failed validation.
    #[error("Invalid product: {0}")]
    InvalidProduct(String),

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    /// Writing or reading the persisted record failed.
    ///
    /// ## When This Occurs
    /// - Serialization of the state failed
    /// - The storage file couldn't be written or renamed
    /// - A stored record couldn't be parsed back
    #[error("Persistence failed: {0}")]
    PersistenceFailure(String),

    /// A write would push the storage area over its byte quota.
    #[error("Storage quota exceeded writing '{key}': {required} bytes needed, quota is {quota}")]
    QuotaExceeded { key: String, required: u64, quota: u64 },

    /// An asynchronous backend was used before `initialize()` completed.
    #[error("{0} backend used before initialize()")]
    NotInitialized(&'static str),

    /// An asynchronous backend was built outside a tokio runtime.
    #[error("No tokio runtime available for background writes")]
    NoRuntime,

    /// The remote cart API rejected or failed a request.
    #[error("Remote backend failed{}: {message}", status_suffix(.status))]
    RemoteBackendFailure { status: Option<u16>, message: String },

    /// SQLite query, connection or migration failed.
    #[error("Database error: {0}")]
    Database(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Invalid store configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<CoreError> for StoreError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidQuantity { quantity } => StoreError::InvalidQuantity { quantity },
            CoreError::InvalidProduct { reason } => StoreError::InvalidProduct(reason),
            CoreError::Validation(e) => StoreError::InvalidConfig(e.to_string()),
        }
    }
}

impl From<ValidationError> for StoreError {
    fn from(err: ValidationError) -> Self {
        StoreError::InvalidConfig(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::PersistenceFailure(format!("cart record (de)serialization failed: {}", err))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::PersistenceFailure(err.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed => StoreError::Database("Pool is closed".to_string()),
            sqlx::Error::PoolTimedOut => StoreError::Database("Connection pool exhausted".to_string()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        StoreError::Database(format!("Migration failed: {}", err))
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::RemoteBackendFailure {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for StoreError {
    fn from(err: url::ParseError) -> Self {
        StoreError::InvalidConfig(format!("Invalid URL: {}", err))
    }
}

impl From<toml::de::Error> for StoreError {
    fn from(err: toml::de::Error) -> Self {
        StoreError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for StoreError {
    fn from(err: toml::ser::Error) -> Self {
        StoreError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl StoreError {
    /// Returns true if a later attempt at the same write could succeed.
    ///
    /// Nothing in cartkit retries automatically. This is for callers that
    /// want to re-save from an error callback.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::RemoteBackendFailure { status, .. } => match status {
                None => true,
                Some(code) => *code >= 500 || *code == 429,
            },
            StoreError::Database(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error came from writing or reading persisted data.
    pub fn is_persistence_error(&self) -> bool {
        matches!(
            self,
            StoreError::PersistenceFailure(_)
                | StoreError::QuotaExceeded { .. }
                | StoreError::NotInitialized(_)
                | StoreError::NoRuntime
                | StoreError::RemoteBackendFailure { .. }
                | StoreError::Database(_)
        )
    }

    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            StoreError::InvalidConfig(_)
                | StoreError::ConfigLoadFailed(_)
                | StoreError::ConfigSaveFailed(_)
        )
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
