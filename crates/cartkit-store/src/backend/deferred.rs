//! # Deferred Persistence
//!
//! Shared machinery for the asynchronous backends (SQLite, remote API).
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  CartStore ── save(state) ──► AsyncCache.store(state)   (immediate)     │
//! │                      │                                                  │
//! │                      └──────► WriteQueue.enqueue(Save)  (non-blocking)  │
//! │                                        │                                │
//! │                                        ▼ unbounded mpsc                 │
//! │                               ┌──────────────────┐                      │
//! │                               │   writer task    │  one task, commands  │
//! │                               │  (tokio::spawn)  │  applied in order    │
//! │                               └────────┬─────────┘                      │
//! │                                        │                                │
//! │                                        ▼                                │
//! │                               RecordSink::write / erase                 │
//! │                                        │                                │
//! │                                   Err? └──► ErrorSlot ──► callback      │
//! │                                                                         │
//! │  CartStore ── load() ────────► AsyncCache.value (None until loaded)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use cartkit_core::CartState;

use super::ErrorCallback;
use crate::error::{StoreError, StoreResult};

// =============================================================================
// Async Cache
// =============================================================================

/// Two-state cache in front of an asynchronous store.
///
/// `loaded == false` means "we haven't heard from the store yet", which is
/// different from `loaded == true, value == None` ("the store has no cart").
#[derive(Debug, Clone, Default)]
pub struct AsyncCache {
    value: Option<CartState>,
    loaded: bool,
}

impl AsyncCache {
    pub fn value(&self) -> Option<CartState> {
        self.value.clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Records what the store returned.
    pub fn fill(&mut self, value: Option<CartState>) {
        self.value = value;
        self.loaded = true;
    }

    /// Records a local write. Local writes are newer than anything in flight.
    pub fn store(&mut self, state: CartState) {
        self.fill(Some(state));
    }

    pub fn clear(&mut self) {
        self.fill(None);
    }
}

/// Shared cache handle.
pub(crate) type SharedCache = Arc<Mutex<AsyncCache>>;

pub(crate) fn lock_cache(cache: &SharedCache) -> MutexGuard<'_, AsyncCache> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Error Slot
// =============================================================================

/// Late-bound error callback.
///
/// The store attaches its callback after the backend was built, so the
/// writer task reads the slot at failure time.
#[derive(Clone, Default)]
pub struct ErrorSlot {
    callback: Arc<RwLock<Option<ErrorCallback>>>,
}

impl ErrorSlot {
    pub fn set(&self, callback: Option<ErrorCallback>) {
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = callback;
    }

    pub fn report(&self, err: &StoreError) {
        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(err);
        }
    }
}

impl std::fmt::Debug for ErrorSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorSlot").finish_non_exhaustive()
    }
}

// =============================================================================
// Record Sink
// =============================================================================

/// The asynchronous end of a deferred backend.
#[async_trait]
pub trait RecordSink: Send + Sync + 'static {
    /// Short name for logs and `NotInitialized` errors.
    fn name(&self) -> &'static str;

    async fn write(&self, state: &CartState) -> StoreResult<()>;

    async fn erase(&self) -> StoreResult<()>;
}

// =============================================================================
// Write Queue
// =============================================================================

#[derive(Debug)]
enum WriteCommand {
    Save(CartState),
    Clear,
    /// Acknowledged once every earlier command has been applied.
    Flush(oneshot::Sender<()>),
}

/// Handle to the single background writer of one backend.
///
/// Dropping the handle lets the writer drain what is queued and exit.
#[derive(Debug)]
pub struct WriteQueue {
    name: &'static str,
    cmd_tx: mpsc::UnboundedSender<WriteCommand>,
}

impl WriteQueue {
    /// Spawns the writer on `runtime`.
    pub fn start<S: RecordSink>(runtime: &Handle, sink: Arc<S>, errors: ErrorSlot) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let name = sink.name();
        runtime.spawn(run_writer(sink, cmd_rx, errors));
        debug!(backend = name, "Background writer started");
        WriteQueue { name, cmd_tx }
    }

    pub fn enqueue_save(&self, state: CartState) -> StoreResult<()> {
        self.send(WriteCommand::Save(state))
    }

    pub fn enqueue_clear(&self) -> StoreResult<()> {
        self.send(WriteCommand::Clear)
    }

    /// Waits until every write queued so far has been applied (or failed).
    pub async fn flush(&self) -> StoreResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send(WriteCommand::Flush(ack_tx))?;
        ack_rx.await.map_err(|_| self.closed())
    }

    fn send(&self, cmd: WriteCommand) -> StoreResult<()> {
        self.cmd_tx.send(cmd).map_err(|_| self.closed())
    }

    fn closed(&self) -> StoreError {
        StoreError::PersistenceFailure(format!("{} writer has stopped", self.name))
    }
}

/// Writer loop: one command at a time, in arrival order.
async fn run_writer<S: RecordSink>(
    sink: Arc<S>,
    mut cmd_rx: mpsc::UnboundedReceiver<WriteCommand>,
    errors: ErrorSlot,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        let result = match cmd {
            WriteCommand::Save(state) => sink.write(&state).await,
            WriteCommand::Clear => sink.erase().await,
            WriteCommand::Flush(ack) => {
                let _ = ack.send(());
                continue;
            }
        };

        // Failed writes are reported once and never retried.
        if let Err(e) = result {
            error!(backend = sink.name(), error = %e, "Background write failed");
            errors.report(&e);
        }
    }
    debug!(backend = sink.name(), "Background writer stopped");
}

/// Captures the current tokio runtime.
pub(crate) fn current_runtime() -> StoreResult<Handle> {
    Handle::try_current().map_err(|_| StoreError::NoRuntime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartkit_core::{CartItem, Money, Product};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSink {
        log: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl RecordSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn write(&self, state: &CartState) -> StoreResult<()> {
            tokio::task::yield_now().await;
            if self.fail {
                return Err(StoreError::PersistenceFailure("disk on fire".into()));
            }
            self.log
                .lock()
                .unwrap()
                .push(format!("save:{}", state.item_count()));
            Ok(())
        }

        async fn erase(&self) -> StoreResult<()> {
            self.log.lock().unwrap().push("clear".to_string());
            Ok(())
        }
    }

    fn state_with(quantity: i64) -> CartState {
        CartState::from_items(vec![CartItem::new(
            Product::new("1", "Widget", Money::from_cents(10)),
            quantity,
            Utc::now(),
        )])
    }

    #[test]
    fn test_cache_states() {
        let mut cache = AsyncCache::default();
        assert!(!cache.is_loaded());
        assert!(cache.value().is_none());

        cache.fill(None);
        assert!(cache.is_loaded());
        assert!(cache.value().is_none());

        cache.store(state_with(1));
        assert_eq!(cache.value().map(|s| s.item_count()), Some(1));

        cache.clear();
        assert!(cache.is_loaded());
        assert!(cache.value().is_none());
    }

    #[tokio::test]
    async fn test_writes_applied_in_order() {
        let sink = Arc::new(RecordingSink::default());
        let queue = WriteQueue::start(&Handle::current(), Arc::clone(&sink), ErrorSlot::default());

        queue.enqueue_save(state_with(1)).unwrap();
        queue.enqueue_save(state_with(2)).unwrap();
        queue.enqueue_clear().unwrap();
        queue.enqueue_save(state_with(3)).unwrap();
        queue.flush().await.unwrap();

        let log = sink.log.lock().unwrap().clone();
        assert_eq!(log, vec!["save:1", "save:2", "clear", "save:3"]);
    }

    #[tokio::test]
    async fn test_failures_go_to_error_slot() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let errors = ErrorSlot::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        errors.set(Some(Arc::new(move |_e: &StoreError| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        let queue = WriteQueue::start(&Handle::current(), sink, errors);
        queue.enqueue_save(state_with(1)).unwrap();
        queue.enqueue_save(state_with(2)).unwrap();
        queue.flush().await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_no_runtime_detected() {
        assert!(matches!(current_runtime(), Err(StoreError::NoRuntime)));
    }
}
