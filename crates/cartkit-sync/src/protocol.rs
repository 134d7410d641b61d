//! # Cart Sync Protocol
//!
//! The one message contexts exchange.
//!
//! ## Wire Format
//! ```json
//! {
//!   "type": "cart-update",
//!   "state": { "items": [...], "total": 50, "itemCount": 5 },
//!   "timestamp": 1700000000000
//! }
//! ```
//!
//! `timestamp` is the newest `addedAt` among the items, in milliseconds
//! (0 for an empty cart). It is derived from the data, never from the
//! clock at send time, so an echo of a state carries the same timestamp
//! as the state it echoes.

use serde::{Deserialize, Serialize};

use cartkit_core::CartState;

use crate::error::{SyncError, SyncResult};

/// Messages posted on a cart broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CartMessage {
    /// A context's complete cart after a change.
    CartUpdate { state: CartState, timestamp: i64 },
}

impl CartMessage {
    /// Update message for `state`, stamped with its derived timestamp.
    pub fn cart_update(state: &CartState) -> Self {
        CartMessage::CartUpdate {
            timestamp: state.timestamp(),
            state: state.clone(),
        }
    }

    pub fn state(&self) -> &CartState {
        match self {
            CartMessage::CartUpdate { state, .. } => state,
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            CartMessage::CartUpdate { timestamp, .. } => *timestamp,
        }
    }

    pub fn encode(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a payload received from a peer.
    pub fn decode(payload: &str) -> SyncResult<Self> {
        let value: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| SyncError::DeserializationFailed(e.to_string()))?;

        match value.get("type").and_then(|t| t.as_str()) {
            Some("cart-update") => serde_json::from_value(value)
                .map_err(|e| SyncError::DeserializationFailed(e.to_string())),
            Some(other) => Err(SyncError::InvalidMessage(format!(
                "unknown message type '{}'",
                other
            ))),
            None => Err(SyncError::InvalidMessage("missing message type".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartkit_core::{CartItem, Money, Product};
    use chrono::{TimeZone, Utc};

    fn state() -> CartState {
        let added_at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        CartState::from_items(vec![CartItem::new(
            Product::new("1", "Widget", Money::from_cents(1000)),
            2,
            added_at,
        )])
    }

    #[test]
    fn test_wire_shape() {
        let json = serde_json::to_value(CartMessage::cart_update(&state())).unwrap();

        assert_eq!(json["type"], "cart-update");
        assert_eq!(json["timestamp"], 1_700_000_000_000i64);
        assert_eq!(json["state"]["itemCount"], 2);
        assert_eq!(json["state"]["total"], 20);
    }

    #[test]
    fn test_empty_cart_timestamp_is_zero() {
        assert_eq!(CartMessage::cart_update(&CartState::empty()).timestamp(), 0);
    }

    #[test]
    fn test_decode() {
        let message = CartMessage::cart_update(&state());
        let decoded = CartMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);

        assert!(matches!(
            CartMessage::decode("not json"),
            Err(SyncError::DeserializationFailed(_))
        ));
        assert!(matches!(
            CartMessage::decode(r#"{"type":"ping"}"#),
            Err(SyncError::InvalidMessage(_))
        ));
        assert!(matches!(
            CartMessage::decode(r#"{"type":"cart-update","state":{}}"#),
            Err(SyncError::DeserializationFailed(_))
        ));
    }
}
