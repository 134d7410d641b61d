//! # Validation Module
//!
//! Input validation for cart operations and configuration.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: UI front end                                                 │
//! │  └── Immediate user feedback                                           │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: CartStore / CartManager                                      │
//! │  └── THIS MODULE: quantity and product rules                           │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Config loading                                               │
//! │  └── THIS MODULE: storage keys, history bounds                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use cartkit_core::validation::{validate_quantity, validate_storage_key};
//!
//! assert!(validate_quantity(2).is_ok());
//! assert!(validate_quantity(0).is_err());
//! assert!(validate_storage_key("cart-state").is_ok());
//! ```

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::types::Product;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Longest storage key accepted by the key-value backends.
pub const MAX_STORAGE_KEY_LEN: usize = 128;

// =============================================================================
// Cart Validators
// =============================================================================

/// Validates a quantity passed to `add_item`.
///
/// ## Rules
/// - Must be at least 1
///
/// `update_quantity` does NOT use this: a quantity of zero or less there
/// means "remove the line".
pub fn validate_quantity(quantity: i64) -> CoreResult<()> {
    if quantity <= 0 {
        return Err(CoreError::InvalidQuantity { quantity });
    }
    Ok(())
}

/// Validates a product before it enters the cart.
///
/// ## Rules
/// - `id` must not be empty (the identity rule keys on it)
/// - `price` must not be negative
pub fn validate_product(product: &Product) -> CoreResult<()> {
    if product.id.trim().is_empty() {
        return Err(CoreError::InvalidProduct {
            reason: "product id is empty".to_string(),
        });
    }
    if product.price.is_negative() {
        return Err(CoreError::InvalidProduct {
            reason: format!("price {} is negative", product.price),
        });
    }
    Ok(())
}

// =============================================================================
// Configuration Validators
// =============================================================================

/// Validates a storage key (file name stem, sqlite row key).
///
/// ## Rules
/// - Must not be empty
/// - At most [`MAX_STORAGE_KEY_LEN`] characters
/// - Only `[A-Za-z0-9._-]`, so a key is usable as a file name as-is and two
///   distinct keys never name the same record
pub fn validate_storage_key(key: &str) -> ValidationResult<()> {
    if key.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "storage key".to_string(),
        });
    }
    if key.chars().count() > MAX_STORAGE_KEY_LEN {
        return Err(ValidationError::TooLong {
            field: "storage key".to_string(),
            max: MAX_STORAGE_KEY_LEN,
        });
    }
    if let Some(character) = key.chars().find(|c| !is_storage_key_char(*c)) {
        return Err(ValidationError::InvalidCharacter {
            field: "storage key".to_string(),
            character,
        });
    }
    Ok(())
}

fn is_storage_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// Validates a history bound.
pub fn validate_max_entries(max_entries: usize) -> ValidationResult<()> {
    if max_entries == 0 {
        return Err(ValidationError::MustBePositive {
            field: "max_entries".to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Money;

    #[test]
    fn test_validate_quantity() {
        assert!(validate_quantity(1).is_ok());
        assert!(validate_quantity(500).is_ok());
        assert!(matches!(
            validate_quantity(0),
            Err(CoreError::InvalidQuantity { quantity: 0 })
        ));
        assert!(matches!(
            validate_quantity(-1),
            Err(CoreError::InvalidQuantity { quantity: -1 })
        ));
    }

    #[test]
    fn test_validate_product() {
        assert!(validate_product(&Product::new("1", "Widget", Money::from_cents(10))).is_ok());
        assert!(validate_product(&Product::new("1", "Freebie", Money::zero())).is_ok());
        assert!(validate_product(&Product::new("", "Widget", Money::from_cents(10))).is_err());
        assert!(validate_product(&Product::new("1", "Widget", Money::from_cents(-1))).is_err());
    }

    #[test]
    fn test_validate_storage_key() {
        assert!(validate_storage_key("cart-state").is_ok());
        assert!(validate_storage_key("").is_err());
        assert!(validate_storage_key("   ").is_err());
        assert!(validate_storage_key(&"k".repeat(128)).is_ok());
        assert!(validate_storage_key(&"k".repeat(129)).is_err());
        assert!(validate_storage_key("shop_42.cart-v2").is_ok());
    }

    #[test]
    fn test_storage_key_rejects_characters_outside_file_safe_set() {
        for key in ["cart/state", "cart:state", "cart state", "cart?", "../cart", "cärt"] {
            assert!(
                matches!(
                    validate_storage_key(key),
                    Err(ValidationError::InvalidCharacter { .. })
                ),
                "{key} should be rejected"
            );
        }
        // Keys that a lossy mapping would have collapsed together stay distinct.
        assert!(validate_storage_key("cart_state").is_ok());
        assert!(validate_storage_key("cart/state").is_err());
    }

    #[test]
    fn test_validate_max_entries() {
        assert!(validate_max_entries(1).is_ok());
        assert!(validate_max_entries(10).is_ok());
        assert!(validate_max_entries(0).is_err());
    }
}
