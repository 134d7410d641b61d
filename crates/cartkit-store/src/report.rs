//! # Error Reports
//!
//! Serializable error descriptions handed to the manager's error callback.
//!
//! ## What the UI Receives
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  manager.add_item(&product, 0)                                          │
//! │         │                                                               │
//! │         ▼                                                               │
//! │  StoreError::InvalidQuantity { quantity: 0 }                            │
//! │         │                                                               │
//! │         ▼  ErrorReport::new("addItem", &err)                            │
//! │  {                                                                      │
//! │    "code": "INVALID_QUANTITY",                                          │
//! │    "operation": "addItem",                                              │
//! │    "message": "Invalid quantity 0: must be at least 1"                  │
//! │  }                                                                      │
//! │         │                                                               │
//! │         ├──► on_error callback                                          │
//! │         └──► tracing::warn!                                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::Serialize;
use ts_rs::TS;

use crate::error::StoreError;

/// A failed cart operation, ready for display or telemetry.
///
/// ## Serialization
/// ```json
/// {
///   "code": "QUOTA_EXCEEDED",
///   "operation": "persist",
///   "message": "Storage quota exceeded writing 'cart-state': ..."
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct ErrorReport {
    /// Machine-readable error code for programmatic handling
    pub code: ErrorCode,

    /// Which operation failed (`addItem`, `persist`, ...)
    pub operation: String,

    /// Human-readable error message for display
    pub message: String,
}

/// Error codes for reports.
///
/// ## Usage in Frontend
/// ```typescript
/// manager.onError((report) => {
///   switch (report.code) {
///     case 'INVALID_QUANTITY':
///       highlightQuantityField();
///       break;
///     case 'QUOTA_EXCEEDED':
///       showNotification('Your cart could not be saved');
///       break;
///   }
/// });
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[ts(export)]
pub enum ErrorCode {
    /// Quantity below 1
    InvalidQuantity,

    /// Product failed validation
    InvalidProduct,

    /// Writing or reading the persisted cart failed
    PersistenceFailure,

    /// Storage area is full
    QuotaExceeded,

    /// The cart API answered with an error or was unreachable
    RemoteBackendFailure,

    /// Asynchronous backend used before initialization
    NotInitialized,

    /// Bad or unreadable configuration
    Configuration,

    /// Anything else
    Internal,
}

impl ErrorReport {
    pub fn new(operation: impl Into<String>, err: &StoreError) -> Self {
        ErrorReport {
            code: ErrorCode::from(err),
            operation: operation.into(),
            message: err.to_string(),
        }
    }

    /// A report that did not come from a [`StoreError`].
    pub fn internal(operation: impl Into<String>, message: impl Into<String>) -> Self {
        ErrorReport {
            code: ErrorCode::Internal,
            operation: operation.into(),
            message: message.into(),
        }
    }
}

impl From<&StoreError> for ErrorCode {
    fn from(err: &StoreError) -> Self {
        match err {
            StoreError::InvalidQuantity { .. } => ErrorCode::InvalidQuantity,
            StoreError::InvalidProduct(_) => ErrorCode::InvalidProduct,
            StoreError::PersistenceFailure(_) | StoreError::Database(_) => {
                ErrorCode::PersistenceFailure
            }
            StoreError::QuotaExceeded { .. } => ErrorCode::QuotaExceeded,
            StoreError::RemoteBackendFailure { .. } => ErrorCode::RemoteBackendFailure,
            StoreError::NotInitialized(_) => ErrorCode::NotInitialized,
            StoreError::NoRuntime
            | StoreError::InvalidConfig(_)
            | StoreError::ConfigLoadFailed(_)
            | StoreError::ConfigSaveFailed(_) => ErrorCode::Configuration,
        }
    }
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:?}] {}: {}", self.code, self.operation, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_json_shape() {
        let report = ErrorReport::new("addItem", &StoreError::InvalidQuantity { quantity: 0 });
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["code"], "INVALID_QUANTITY");
        assert_eq!(json["operation"], "addItem");
        assert_eq!(json["message"], "Invalid quantity 0: must be at least 1");
    }

    #[test]
    fn test_code_mapping() {
        let quota = StoreError::QuotaExceeded {
            key: "k".into(),
            required: 2,
            quota: 1,
        };
        assert_eq!(ErrorCode::from(&quota), ErrorCode::QuotaExceeded);
        assert_eq!(
            ErrorCode::from(&StoreError::Database("locked".into())),
            ErrorCode::PersistenceFailure
        );
        assert_eq!(
            ErrorCode::from(&StoreError::NotInitialized("sqlite")),
            ErrorCode::NotInitialized
        );
        assert_eq!(ErrorCode::from(&StoreError::NoRuntime), ErrorCode::Configuration);
        assert_eq!(
            serde_json::to_value(ErrorCode::RemoteBackendFailure).unwrap(),
            "REMOTE_BACKEND_FAILURE"
        );
    }
}
