//! # cartkit-core: Pure Cart Model
//!
//! This crate is the **heart** of cartkit. It defines what a cart is and
//! the rules every cart obeys, with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        cartkit Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              UI front ends (one per tab / context)              │   │
//! │  │    Product list ──► Cart drawer ──► Checkout ──► Undo menu      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │          cartkit-sync  (broadcast, last-write-wins replay)      │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │          cartkit-store (CartStore, backends, history)           │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ cartkit-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │   money   │  │   clock   │  │ validation│  │   │
//! │  │   │ CartState │  │   Money   │  │  System   │  │   rules   │  │   │
//! │  │   │ CartItem  │  │           │  │  Manual   │  │  checks   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Product, CartItem, CartState, HistoryEntry
//! - [`money`] - Money type with integer arithmetic (no floating point!)
//! - [`clock`] - Injectable time source
//! - [`error`] - Domain error types
//! - [`validation`] - Cart and configuration rules
//!
//! ## Example Usage
//!
//! ```rust
//! use cartkit_core::{CartItem, CartState, Money, Product};
//! use chrono::Utc;
//!
//! let widget = Product::new("1", "Widget", Money::from_cents(10));
//! let state = CartState::from_items(vec![CartItem::new(widget, 2, Utc::now())]);
//!
//! assert_eq!(state.total().cents(), 20);
//! assert_eq!(state.item_count(), 2);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod clock;
pub mod error;
pub mod money;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================
// These allow users to do `use cartkit_core::Money` instead of
// `use cartkit_core::money::Money`

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult, ValidationError};
pub use money::Money;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Key the cart record is persisted under unless overridden.
pub const DEFAULT_STORAGE_KEY: &str = "cart-state";

/// Key the history list is persisted under unless overridden.
pub const DEFAULT_HISTORY_KEY: &str = "cart-history";

/// Broadcast channel name shared by every context of one application.
///
/// Configurable so unrelated applications on the same origin don't collide.
pub const DEFAULT_CHANNEL_NAME: &str = "cart-sync";

/// History entries kept before the oldest is evicted.
pub const DEFAULT_MAX_HISTORY_ENTRIES: usize = 10;

/// Per-area byte quota for the key-value storages (5 MiB).
pub const DEFAULT_STORAGE_QUOTA_BYTES: u64 = 5 * 1024 * 1024;
