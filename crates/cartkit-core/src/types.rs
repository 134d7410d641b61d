//! # Domain Types
//!
//! Core cart types shared by every front end, backend and sync peer.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Product      │   │    CartItem     │   │   CartState     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id             │◄──│  product        │◄──│  items[]        │       │
//! │  │  name           │   │  id (UUID)      │   │  total (derived)│       │
//! │  │  price (Money)  │   │  quantity >= 1  │   │  itemCount      │       │
//! │  │  attributes {}  │   │  addedAt        │   │    (derived)    │       │
//! │  └─────────────────┘   └─────────────────┘   └────────┬────────┘       │
//! │                                                       │ deep copy      │
//! │                                              ┌────────▼────────┐       │
//! │                                              │  HistoryEntry   │       │
//! │                                              │  id, timestamp  │       │
//! │                                              │  label?, meta?  │       │
//! │                                              └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dual-Key Identity Pattern
//! - `CartItem.id`: UUID v4 generated when the line is inserted
//! - `Product.id`: the catalogue identifier; at most one line per product

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use ts_rs::TS;
use uuid::Uuid;

use crate::money::Money;

// =============================================================================
// Product
// =============================================================================

/// A product as handed to the cart by the catalogue.
///
/// The store clones what it is given; the caller's copy is never touched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Product {
    /// Catalogue identifier. The cart's identity rule keys on this.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Unit price. Minor units in memory, major units on the wire.
    pub price: Money,

    /// Image URL for cart thumbnails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub description: Option<String>,

    /// Open-ended extra fields (size, colour, vendor data...).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    #[ts(type = "Record<string, unknown>")]
    pub attributes: Map<String, Value>,
}

impl Product {
    /// Creates a product with no optional fields.
    pub fn new(id: impl Into<String>, name: impl Into<String>, price: Money) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            price,
            image: None,
            description: None,
            attributes: Map::new(),
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Adds one open-ended attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// Cart Item
// =============================================================================

/// One line in the cart.
///
/// ## Invariant
/// `quantity >= 1`. A line whose quantity would drop to zero is removed
/// instead; zero-quantity records never exist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct CartItem {
    /// Line identifier (UUID v4), distinct from `product.id`.
    pub id: String,

    /// Snapshot of the product at insertion time.
    pub product: Product,

    pub quantity: i64,

    /// Insertion time. Drives the sync timestamp.
    #[ts(as = "String")]
    pub added_at: DateTime<Utc>,
}

impl CartItem {
    /// Creates a new line with a freshly generated id.
    pub fn new(product: Product, quantity: i64, added_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            product,
            quantity,
            added_at,
        }
    }

    /// `price * quantity` for this line.
    #[inline]
    pub fn line_total(&self) -> Money {
        self.product.price * self.quantity
    }
}

// =============================================================================
// Cart State
// =============================================================================

/// A snapshot of the whole cart.
///
/// `total` and `item_count` are derived. They can only be produced by
/// [`CartState::from_items`], and deserialization goes through the same
/// constructor, so a persisted record carrying stale totals is corrected
/// on load.
///
/// ## JSON Shape
/// ```json
/// { "items": [...], "total": 39.98, "itemCount": 2 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct CartState {
    items: Vec<CartItem>,
    total: Money,
    item_count: i64,
}

/// Wire form accepted on deserialization. Totals are ignored.
#[derive(Deserialize)]
struct CartStateRecord {
    #[serde(default)]
    items: Vec<CartItem>,
}

impl<'de> Deserialize<'de> for CartState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let record = CartStateRecord::deserialize(deserializer)?;
        Ok(CartState::from_items(record.items))
    }
}

impl CartState {
    /// Builds a state from its items, computing the derived fields.
    pub fn from_items(items: Vec<CartItem>) -> Self {
        let total = items.iter().map(CartItem::line_total).sum();
        let item_count = items.iter().map(|i| i.quantity).sum();
        Self {
            items,
            total,
            item_count,
        }
    }

    /// The empty cart.
    pub fn empty() -> Self {
        Self::from_items(Vec::new())
    }

    pub fn items(&self) -> &[CartItem] {
        &self.items
    }

    pub fn into_items(self) -> Vec<CartItem> {
        self.items
    }

    /// Sum of `price * quantity` over all lines.
    pub fn total(&self) -> Money {
        self.total
    }

    /// Sum of quantities over all lines.
    pub fn item_count(&self) -> i64 {
        self.item_count
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of distinct lines.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Finds the line holding `product_id`, if any.
    pub fn find_by_product(&self, product_id: &str) -> Option<&CartItem> {
        self.items.iter().find(|i| i.product.id == product_id)
    }

    /// Finds a line by its own id.
    pub fn find_item(&self, item_id: &str) -> Option<&CartItem> {
        self.items.iter().find(|i| i.id == item_id)
    }

    /// Sync timestamp: the latest `addedAt` in epoch milliseconds, `0` when empty.
    ///
    /// ## Conflict Resolution
    /// ```text
    /// Context A: items added at t=100, t=250  → timestamp 250
    /// Context B: item added at t=180          → timestamp 180
    ///
    /// B receives A's broadcast: 250 > 180     → B replays A's items
    /// A receives B's broadcast: 180 <= 250    → discarded
    /// ```
    /// This is derived from the data itself, not the wall-clock send time.
    pub fn timestamp(&self) -> i64 {
        self.items
            .iter()
            .map(|i| i.added_at.timestamp_millis())
            .max()
            .unwrap_or(0)
    }
}

impl Default for CartState {
    fn default() -> Self {
        Self::empty()
    }
}

// =============================================================================
// History Entry
// =============================================================================

/// A labelled snapshot of a past cart state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct HistoryEntry {
    /// Entry identifier (UUID v4).
    pub id: String,

    /// Deep copy of the cart at snapshot time.
    pub state: CartState,

    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub label: Option<String>,

    /// Caller-defined data stored alongside the snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(type = "unknown")]
    pub metadata: Option<Value>,
}

impl HistoryEntry {
    pub fn new(
        state: CartState,
        timestamp: DateTime<Utc>,
        label: Option<String>,
        metadata: Option<Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state,
            timestamp,
            label,
            metadata,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
