//! # Error Types
//!
//! Domain-specific error types for cartkit-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  cartkit-core errors (this file)                                       │
//! │  ├── CoreError        - Cart rule violations                           │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  cartkit-store errors (separate crate)                                 │
//! │  └── StoreError       - Persistence and configuration failures         │
//! │                                                                         │
//! │  cartkit-sync errors (separate crate)                                  │
//! │  └── SyncError        - Transport and wire-format failures             │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → StoreError → ErrorReport → UI     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Cart rule violations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Quantity was zero or negative.
    ///
    /// ## When This Occurs
    /// ```text
    /// add_item(widget, 0)
    ///      │
    ///      ▼
    /// InvalidQuantity { quantity: 0 }
    ///      │
    ///      ▼
    /// Cart unchanged, nothing persisted, nobody notified
    /// ```
    #[error("Invalid quantity {quantity}: must be at least 1")]
    InvalidQuantity { quantity: i64 },

    /// Product cannot be placed in a cart.
    #[error("Invalid product: {reason}")]
    InvalidProduct { reason: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Field contains a character outside its allowed set.
    #[error("{field} contains invalid character {character:?}")]
    InvalidCharacter { field: String, character: char },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Value must be zero or greater.
    #[error("{field} must not be negative")]
    MustNotBeNegative { field: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::InvalidQuantity { quantity: -1 };
        assert_eq!(err.to_string(), "Invalid quantity -1: must be at least 1");
    }

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::Required {
            field: "product.id".to_string(),
        };
        assert_eq!(err.to_string(), "product.id is required");

        let err = ValidationError::TooLong {
            field: "storage key".to_string(),
            max: 128,
        };
        assert_eq!(err.to_string(), "storage key must be at most 128 characters");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::MustNotBeNegative {
            field: "price".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));
    }
}
