//! In-memory backend, used when no persistence is requested.

use std::sync::{Arc, Mutex, PoisonError};

use cartkit_core::CartState;

use super::{Backend, BackendKind};
use crate::error::StoreResult;

/// Holds the last saved state. Clones share it.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<Option<CartState>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn save(&self, state: &CartState) -> StoreResult<()> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some(state.clone());
        Ok(())
    }

    fn load(&self) -> StoreResult<Option<CartState>> {
        Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn clear(&self) -> StoreResult<()> {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartkit_core::{CartItem, Money, Product};
    use chrono::Utc;

    #[test]
    fn test_memory_round_trip() {
        let backend = MemoryBackend::new();
        assert!(backend.load().unwrap().is_none());

        let empty = CartState::empty();
        backend.save(&empty).unwrap();
        assert_eq!(backend.load().unwrap(), Some(empty));

        let state = CartState::from_items(vec![CartItem::new(
            Product::new("1", "Widget", Money::from_cents(10)),
            2,
            Utc::now(),
        )]);
        backend.save(&state).unwrap();
        assert_eq!(backend.load().unwrap(), Some(state));

        backend.clear().unwrap();
        assert!(backend.load().unwrap().is_none());
    }
}
