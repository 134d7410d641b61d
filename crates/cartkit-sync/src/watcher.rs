//! # Storage Fallback Watcher
//!
//! Picks up cart records written by other contexts that share the same
//! storage area, for when the broadcast channel is missing or a peer is
//! not on it.
//!
//! ```text
//!   every poll_interval:
//!     marker = storage.modified_marker(key)
//!     marker == last seen  ──► nothing
//!     marker changed       ──► read record ──► CartState ──► on_change
//!                                   │
//!                                   └─ unreadable ──► on_change(Err)
//! ```
//!
//! The baseline marker is taken when the watcher starts, so records that
//! were already present are not replayed.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use cartkit_core::CartState;
use cartkit_store::KeyValueStorage;

use crate::error::{SyncError, SyncResult};

#[derive(Clone)]
pub struct StorageWatcher {
    storage: Arc<dyn KeyValueStorage>,
    key: String,
    interval: Duration,
}

impl std::fmt::Debug for StorageWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageWatcher")
            .field("key", &self.key)
            .field("interval", &self.interval)
            .finish()
    }
}

impl StorageWatcher {
    pub fn new(storage: Arc<dyn KeyValueStorage>, key: impl Into<String>, interval: Duration) -> Self {
        StorageWatcher {
            storage,
            key: key.into(),
            interval,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Reads the current record; a missing record is an empty cart.
    pub fn read_state(&self) -> SyncResult<CartState> {
        match self.storage.get_item(&self.key)? {
            None => Ok(CartState::empty()),
            Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                SyncError::DeserializationFailed(format!(
                    "cart record under '{}': {}",
                    self.key, e
                ))
            }),
        }
    }

    /// Polls on `handle` until the returned task is aborted.
    pub fn spawn<F>(self, handle: &Handle, on_change: F) -> JoinHandle<()>
    where
        F: Fn(SyncResult<CartState>) + Send + Sync + 'static,
    {
        let mut last_seen = match self.storage.modified_marker(&self.key) {
            Ok(marker) => marker,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Could not read initial storage marker");
                0
            }
        };

        handle.spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let marker = match self.storage.modified_marker(&self.key) {
                    Ok(marker) => marker,
                    Err(e) => {
                        on_change(Err(e.into()));
                        continue;
                    }
                };
                if marker == last_seen {
                    continue;
                }

                debug!(key = %self.key, marker, last_seen, "Storage record changed");
                last_seen = marker;
                on_change(self.read_state());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartkit_core::{CartItem, Money, Product};
    use cartkit_store::SessionStorage;
    use chrono::Utc;
    use std::sync::Mutex;

    fn state() -> CartState {
        CartState::from_items(vec![CartItem::new(
            Product::new("1", "Widget", Money::from_cents(10)),
            1,
            Utc::now(),
        )])
    }

    type Seen = Arc<Mutex<Vec<SyncResult<CartState>>>>;

    fn start(storage: &SessionStorage) -> (JoinHandle<()>, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let watcher = StorageWatcher::new(
            Arc::new(storage.clone()),
            "cart-state",
            Duration::from_millis(10),
        );
        let task = watcher.spawn(&Handle::current(), move |event| {
            sink.lock().unwrap().push(event)
        });
        (task, seen)
    }

    #[tokio::test]
    async fn test_existing_record_is_not_reported() {
        let storage = SessionStorage::new();
        storage
            .set_item("cart-state", &serde_json::to_string(&state()).unwrap())
            .unwrap();

        let (task, seen) = start(&storage);
        tokio::time::sleep(Duration::from_millis(60)).await;
        task.abort();

        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reports_writes_and_removals() {
        let storage = SessionStorage::new();
        let (task, seen) = start(&storage);

        let written = state();
        storage
            .set_item("cart-state", &serde_json::to_string(&written).unwrap())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        storage.remove_item("cart-state").unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        task.abort();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].as_ref().unwrap(), &written);
        assert!(seen[1].as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_record_is_an_error() {
        let storage = SessionStorage::new();
        let (task, seen) = start(&storage);

        storage.set_item("cart-state", "{ not json").unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        task.abort();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(matches!(seen[0], Err(SyncError::DeserializationFailed(_))));
    }

    #[tokio::test]
    async fn test_other_keys_are_ignored() {
        let storage = SessionStorage::new();
        let (task, seen) = start(&storage);

        storage.set_item("cart-history", "[]").unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        task.abort();

        assert!(seen.lock().unwrap().is_empty());
    }
}
