//! # Sync Error Types
//!
//! Error types for cross-context cart synchronization.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌──────────────────────┐  ┌────────────────────┐ │
//! │  │  Configuration  │  │      Transport       │  │     Protocol       │ │
//! │  │                 │  │                      │  │                    │ │
//! │  │  InvalidConfig  │  │  SyncTransport-      │  │  InvalidMessage    │ │
//! │  │  ConfigLoad...  │  │    Unavailable       │  │  Serialization...  │ │
//! │  │  ConfigSave...  │  │  ChannelClosed       │  │  Deserialization...│ │
//! │  │  NoRuntime      │  │                      │  │                    │ │
//! │  └─────────────────┘  └──────────────────────┘  └────────────────────┘ │
//! │                                                                         │
//! │  Store(StoreError) wraps failures raised by cartkit-store.             │
//! │                                                                         │
//! │  None of these ever touch the local cart: they reach the               │
//! │  SyncObserver and the log, and the context keeps working alone.        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use cartkit_store::StoreError;
use thiserror::Error;

/// Result of a sync operation.
pub type SyncResult<T> = Result<T, SyncError>;

/// Everything that can go wrong while syncing a cart between contexts.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// A `[sync]` value failed validation.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// `cartkit.toml` could not be read or parsed.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// `cartkit.toml` could not be written.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    /// The engine was started outside a tokio runtime.
    #[error("No tokio runtime available for the sync engine")]
    NoRuntime,

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// No broadcast channel could be opened; the context runs local-only.
    #[error("Sync transport unavailable: {0}")]
    SyncTransportUnavailable(String),

    /// The channel was closed while in use.
    #[error("Broadcast channel '{0}' is closed")]
    ChannelClosed(String),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Well-formed JSON that is not a cart message.
    #[error("Not a cart message: {0}")]
    InvalidMessage(String),

    /// An outgoing cart could not be encoded.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// A payload or stored record is not a valid cart.
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    // =========================================================================
    // Store Errors
    // =========================================================================
    #[error(transparent)]
    Store(#[from] StoreError),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SyncError {
    /// Returns true if re-initializing the engine later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::SyncTransportUnavailable(_) | SyncError::ChannelClosed(_) => true,
            SyncError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
                | SyncError::NoRuntime
        )
    }

    /// Returns true if a peer sent something we could not understand.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidMessage(_)
                | SyncError::SerializationFailed(_)
                | SyncError::DeserializationFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(SyncError::SyncTransportUnavailable("hub shut down".into()).is_retryable());
        assert!(SyncError::ChannelClosed("cart-sync".into()).is_retryable());
        assert!(!SyncError::InvalidConfig("bad".into()).is_retryable());
        assert!(!SyncError::DeserializationFailed("eof".into()).is_retryable());
    }

    #[test]
    fn test_categories() {
        assert!(SyncError::NoRuntime.is_config_error());
        assert!(SyncError::InvalidMessage("ping".into()).is_protocol_error());

        let wrapped: SyncError = StoreError::InvalidQuantity { quantity: 0 }.into();
        assert_eq!(wrapped.to_string(), "Invalid quantity 0: must be at least 1");
    }
}
