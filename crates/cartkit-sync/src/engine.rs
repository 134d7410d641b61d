//! # Sync Engine
//!
//! Keeps one context's [`CartStore`] consistent with the other contexts of
//! the same origin.
//!
//! ## Engine Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SyncEngine (context B)                         │
//! │                                                                         │
//! │   CartStore ──subscribe──► post(cart-update) ──► BroadcastChannel ──►  │
//! │       ▲                                                     peers      │
//! │       │ replay                                                          │
//! │  ┌────┴──────────┐    ◄── receive loop ◄── BroadcastChannel ◄── peers   │
//! │  │  Reconciler   │                                                      │
//! │  │               │    ◄── StorageWatcher ◄── shared storage marker      │
//! │  └───────────────┘                                                      │
//! │                                                                         │
//! │  Transport failures reach the SyncObserver; the store keeps working    │
//! │  local-only.                                                            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Reconciliation
//! ```text
//! remote items == local items            ──► Unchanged
//! remote timestamp <= local timestamp    ──► Stale (discarded)
//! otherwise                              ──► replay(remote) ──► Applied
//! ```
//! The whole decision runs inside [`CartStore::replay_if_newer`], under the
//! store's state lock. Timestamps are derived from `addedAt` on both sides;
//! the `timestamp` field a peer sends is informational and never trusted.
//! This is last-write-wins on the whole cart. Two contexts that add different products at about the same
//! time do not merge: the cart with the newer line replaces the other.
//! Replaying goes through the normal mutation path, so the replayed state
//! is persisted, observed and re-broadcast like a local change. Peers
//! discard those re-broadcasts because they are never newer than what
//! they already hold.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cartkit_core::CartState;
use cartkit_store::{CartStore, KeyValueStorage, ReplayOutcome, Subscription};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::CartMessage;
use crate::transport::{BroadcastChannel, ChannelHub};
use crate::watcher::StorageWatcher;

// =============================================================================
// Observer
// =============================================================================

/// Receives what the engine does on its own, outside any caller's stack.
pub trait SyncObserver: Send + Sync {
    /// A remote cart replaced the local one.
    fn on_remote_applied(&self, state: &CartState);

    /// A transport, protocol or fallback failure. Local state is untouched.
    fn on_error(&self, error: &SyncError);
}

/// Observer that ignores everything (failures are still logged).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl SyncObserver for NoOpObserver {
    fn on_remote_applied(&self, _state: &CartState) {}
    fn on_error(&self, _error: &SyncError) {}
}

/// What [`SyncEngine::apply_remote`] did with a remote cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Not newer than the local cart; discarded.
    Stale,
    /// Same items as the local cart; nothing to do.
    Unchanged,
    /// Local cart replaced by the remote one.
    Applied,
}

impl From<ReplayOutcome> for ReconcileOutcome {
    fn from(outcome: ReplayOutcome) -> Self {
        match outcome {
            ReplayOutcome::Stale => ReconcileOutcome::Stale,
            ReplayOutcome::Unchanged => ReconcileOutcome::Unchanged,
            ReplayOutcome::Applied => ReconcileOutcome::Applied,
        }
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// The part of the engine shared with its background tasks.
struct Reconciler {
    store: CartStore,
    observer: Arc<dyn SyncObserver>,
}

impl Reconciler {
    fn apply(&self, remote: &CartState) -> ReconcileOutcome {
        let outcome = ReconcileOutcome::from(self.store.replay_if_newer(remote));

        if outcome == ReconcileOutcome::Applied {
            debug!(
                items = remote.len(),
                timestamp = remote.timestamp(),
                "Remote cart applied"
            );
            self.observer.on_remote_applied(remote);
        }
        outcome
    }

    fn report(&self, error: &SyncError) {
        warn!(error = %error, "Cart sync failed");
        self.observer.on_error(error);
    }
}

// =============================================================================
// Sync Engine
// =============================================================================

/// Handles owned while the engine is running.
struct Running {
    channel: Option<Arc<BroadcastChannel>>,
    subscription: Option<Subscription>,
    tasks: Vec<JoinHandle<()>>,
}

/// Cross-context sync for one [`CartStore`].
///
/// ## Example
/// ```rust,ignore
/// let hub = ChannelHub::new();
/// let engine = SyncEngine::new(manager.store(), SyncConfig::default())
///     .with_hub(hub.clone())
///     .with_observer(Arc::new(NoOpObserver));
/// engine.initialize()?;
/// ```
pub struct SyncEngine {
    reconciler: Arc<Reconciler>,
    config: SyncConfig,
    hub: Option<ChannelHub>,
    fallback: Option<(Arc<dyn KeyValueStorage>, String)>,
    running: Mutex<Option<Running>>,
}

impl SyncEngine {
    pub fn new(store: CartStore, config: SyncConfig) -> Self {
        SyncEngine {
            reconciler: Arc::new(Reconciler {
                store,
                observer: Arc::new(NoOpObserver),
            }),
            config,
            hub: None,
            fallback: None,
            running: Mutex::new(None),
        }
    }

    /// Broadcast transport. Without one the engine runs local-only.
    pub fn with_hub(mut self, hub: ChannelHub) -> Self {
        self.hub = Some(hub);
        self
    }

    /// Watches `key` in `storage` for records written by other contexts.
    pub fn with_storage_fallback(
        mut self,
        storage: Arc<dyn KeyValueStorage>,
        key: impl Into<String>,
    ) -> Self {
        self.fallback = Some((storage, key.into()));
        self.config.storage_fallback = true;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.reconciler = Arc::new(Reconciler {
            store: self.reconciler.store.clone(),
            observer,
        });
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Opens the channel, starts the fallback watcher and begins
    /// broadcasting local changes.
    ///
    /// Transport failures are reported to the observer and do not fail
    /// initialization. Calling this while running does nothing.
    ///
    /// ## Errors
    /// [`SyncError::NoRuntime`] outside a tokio runtime.
    pub fn initialize(&self) -> SyncResult<()> {
        let handle = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;

        let mut running = self.lock_running();
        if running.is_some() {
            debug!("Sync engine already running");
            return Ok(());
        }

        let mut tasks = Vec::new();

        let channel = match self.open_channel() {
            Ok(channel) => Some(Arc::new(channel)),
            Err(e) => {
                self.reconciler.report(&e);
                None
            }
        };

        if let Some(channel) = &channel {
            tasks.push(self.spawn_receiver(&handle, channel));
        }

        if self.config.storage_fallback {
            match &self.fallback {
                Some((storage, key)) => {
                    let watcher = StorageWatcher::new(
                        Arc::clone(storage),
                        key.clone(),
                        self.config.poll_interval(),
                    );
                    let reconciler = Arc::clone(&self.reconciler);
                    tasks.push(watcher.spawn(&handle, move |event| match event {
                        Ok(state) => {
                            reconciler.apply(&state);
                        }
                        Err(e) => reconciler.report(&e),
                    }));
                }
                None => warn!("Storage fallback enabled without a storage area; skipping"),
            }
        }

        let subscription = channel.as_ref().map(|channel| {
            let channel = Arc::clone(channel);
            let reconciler = Arc::clone(&self.reconciler);
            self.reconciler.store.subscribe(move |state| {
                if let Err(e) = channel.post(&CartMessage::cart_update(state)) {
                    reconciler.report(&e);
                }
            })
        });

        info!(
            channel = %self.config.channel_name,
            origin = %self.config.origin,
            broadcasting = channel.is_some(),
            fallback = self.config.storage_fallback && self.fallback.is_some(),
            "Sync engine started"
        );

        *running = Some(Running {
            channel,
            subscription,
            tasks,
        });
        Ok(())
    }

    /// Reconciles a message from another context into the local store.
    ///
    /// Only the carried cart is compared; the message's `timestamp` field
    /// is ignored in favour of the one derived from its items.
    pub fn apply_remote(&self, message: &CartMessage) -> ReconcileOutcome {
        let state = message.state();
        if message.timestamp() != state.timestamp() {
            debug!(
                claimed = message.timestamp(),
                derived = state.timestamp(),
                "Remote timestamp disagrees with its items"
            );
        }
        self.reconciler.apply(state)
    }

    /// Stops broadcasting and receiving. Safe to call repeatedly.
    pub fn stop(&self) {
        let Some(running) = self.lock_running().take() else {
            return;
        };

        if let Some(subscription) = running.subscription {
            subscription.unsubscribe();
        }
        for task in running.tasks {
            task.abort();
        }
        if let Some(channel) = running.channel {
            channel.close();
        }

        info!(channel = %self.config.channel_name, "Sync engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// True while running with an open broadcast channel.
    pub fn channel_available(&self) -> bool {
        self.lock_running()
            .as_ref()
            .and_then(|running| running.channel.as_ref())
            .is_some_and(|channel| !channel.is_closed())
    }

    fn open_channel(&self) -> SyncResult<BroadcastChannel> {
        let hub = self.hub.as_ref().ok_or_else(|| {
            SyncError::SyncTransportUnavailable("no channel hub configured".into())
        })?;
        hub.for_origin(self.config.origin.clone())
            .open(&self.config.channel_name)
    }

    fn spawn_receiver(&self, handle: &Handle, channel: &BroadcastChannel) -> JoinHandle<()> {
        let mut receiver = channel.subscribe();
        let reconciler = Arc::clone(&self.reconciler);

        handle.spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(payload) => match CartMessage::decode(&payload) {
                        Ok(message) => {
                            reconciler.apply(message.state());
                        }
                        Err(e) => reconciler.report(&e),
                    },
                    Err(e) => {
                        debug!(error = %e, "Receive loop ended");
                        break;
                    }
                }
            }
        })
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartkit_core::{Clock, ManualClock, Money, Product};
    use cartkit_store::{SessionStorage, StorageBackend, StoreOptions};
    use chrono::TimeZone;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<CartState>>,
        errors: Mutex<Vec<String>>,
    }

    impl SyncObserver for Recorder {
        fn on_remote_applied(&self, state: &CartState) {
            self.applied.lock().unwrap().push(state.clone());
        }

        fn on_error(&self, error: &SyncError) {
            self.errors.lock().unwrap().push(error.to_string());
        }
    }

    fn widget(id: &str) -> Product {
        Product::new(id, format!("Widget {}", id), Money::from_cents(10))
    }

    fn store_at(clock: &ManualClock) -> CartStore {
        let clock: Arc<dyn Clock> = Arc::new(clock.clone());
        CartStore::with_options(StoreOptions::default().with_clock(clock))
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 1s");
    }

    async fn converged(a: &CartStore, b: &CartStore) {
        eventually(move || async move { a.get_state() == b.get_state() }).await;
    }

    #[tokio::test]
    async fn test_convergence() {
        let hub = ChannelHub::new();
        let clock = ManualClock::at_millis(1_000);
        let (a, b) = (store_at(&clock), store_at(&clock));

        let engine_a = SyncEngine::new(a.clone(), SyncConfig::default()).with_hub(hub.clone());
        let engine_b = SyncEngine::new(b.clone(), SyncConfig::default()).with_hub(hub.clone());
        engine_a.initialize().unwrap();
        engine_b.initialize().unwrap();

        a.add_item(&widget("x"), 2).unwrap();
        converged(&a, &b).await;

        let state = b.get_state();
        assert_eq!(state.len(), 1);
        assert_eq!(state.items()[0].product.id, "x");
        assert_eq!(state.items()[0].id, a.get_state().items()[0].id);
        assert_eq!(state.item_count(), 2);

        // Changes flow the other way too.
        clock.advance(chrono::Duration::milliseconds(10));
        b.add_item(&widget("y"), 1).unwrap();
        converged(&a, &b).await;
        assert_eq!(a.get_state().len(), 2);
    }

    #[tokio::test]
    async fn test_last_write_wins_on_whole_cart() {
        let clock_a = ManualClock::at_millis(100);
        let clock_b = ManualClock::at_millis(200);
        let (a, b) = (store_at(&clock_a), store_at(&clock_b));

        // Each side changes without hearing from the other.
        a.add_item(&widget("x"), 1).unwrap();
        b.add_item(&widget("y"), 1).unwrap();

        let engine_a = SyncEngine::new(a.clone(), SyncConfig::default());
        let engine_b = SyncEngine::new(b.clone(), SyncConfig::default());

        let from_a = CartMessage::cart_update(&a.get_state());
        let from_b = CartMessage::cart_update(&b.get_state());

        assert_eq!(engine_b.apply_remote(&from_a), ReconcileOutcome::Stale);
        assert_eq!(engine_a.apply_remote(&from_b), ReconcileOutcome::Applied);

        // B's cart wins entirely; A's line is gone.
        assert_eq!(a.get_state(), b.get_state());
        assert!(a.get_state().find_by_product("x").is_none());
    }

    #[tokio::test]
    async fn test_second_replay_is_a_no_op() {
        let source = store_at(&ManualClock::at_millis(500));
        source.add_item(&widget("x"), 3).unwrap();
        let message = CartMessage::cart_update(&source.get_state());

        let local = store_at(&ManualClock::at_millis(100));
        let recorder = Arc::new(Recorder::default());
        let engine = SyncEngine::new(local.clone(), SyncConfig::default())
            .with_observer(recorder.clone());

        let notifications = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&notifications);
        let _sub = local.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(engine.apply_remote(&message), ReconcileOutcome::Applied);
        let after_first = notifications.load(Ordering::SeqCst);

        assert_eq!(engine.apply_remote(&message), ReconcileOutcome::Unchanged);
        assert_eq!(notifications.load(Ordering::SeqCst), after_first);
        assert_eq!(recorder.applied.lock().unwrap().len(), 1);
        assert_eq!(local.get_state(), source.get_state());
    }

    #[tokio::test]
    async fn test_stale_remote_is_discarded() {
        let local = store_at(&ManualClock::at_millis(900));
        local.add_item(&widget("x"), 1).unwrap();
        let before = local.get_state();

        let older = store_at(&ManualClock::at_millis(100));
        older.add_item(&widget("y"), 5).unwrap();

        let engine = SyncEngine::new(local.clone(), SyncConfig::default());
        assert_eq!(
            engine.apply_remote(&CartMessage::cart_update(&older.get_state())),
            ReconcileOutcome::Stale
        );
        assert_eq!(
            engine.apply_remote(&CartMessage::cart_update(&CartState::empty())),
            ReconcileOutcome::Stale
        );
        assert_eq!(local.get_state(), before);
    }

    #[tokio::test]
    async fn test_claimed_timestamp_is_not_trusted() {
        let local = store_at(&ManualClock::at_millis(900));
        local.add_item(&widget("x"), 1).unwrap();
        let before = local.get_state();

        let older = store_at(&ManualClock::at_millis(100));
        older.add_item(&widget("y"), 5).unwrap();
        let forged = CartMessage::CartUpdate {
            state: older.get_state(),
            timestamp: i64::MAX,
        };

        let engine = SyncEngine::new(local.clone(), SyncConfig::default());
        assert_eq!(engine.apply_remote(&forged), ReconcileOutcome::Stale);
        assert_eq!(local.get_state(), before);

        // A newer cart claiming an old timestamp still applies.
        let newer = store_at(&ManualClock::at_millis(2_000));
        newer.add_item(&widget("z"), 1).unwrap();
        let understated = CartMessage::CartUpdate {
            state: newer.get_state(),
            timestamp: 0,
        };
        assert_eq!(engine.apply_remote(&understated), ReconcileOutcome::Applied);
        assert_eq!(local.get_state(), newer.get_state());
    }

    #[tokio::test]
    async fn test_local_add_during_apply_keeps_remote_cart_whole() {
        let clock = ManualClock::at_millis(1_000);
        let local = store_at(&clock);
        local.add_item(&widget("l"), 1).unwrap();

        let remote = store_at(&ManualClock::at_millis(2_000));
        remote.add_item(&widget("r"), 1).unwrap();
        clock.set(chrono::Utc.timestamp_millis_opt(3_000).unwrap());

        let handle = local.clone();
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let once = Arc::clone(&fired);
        let _sub = local.subscribe(move |state| {
            if state.is_empty() && !once.swap(true, Ordering::SeqCst) {
                handle.add_item(&widget("z"), 1).unwrap();
            }
        });

        let engine = SyncEngine::new(local.clone(), SyncConfig::default());
        assert_eq!(
            engine.apply_remote(&CartMessage::cart_update(&remote.get_state())),
            ReconcileOutcome::Applied
        );

        let ids: Vec<String> = local
            .get_state()
            .items()
            .iter()
            .map(|item| item.product.id.clone())
            .collect();
        assert_eq!(ids, vec!["r", "z"]);
    }

    #[tokio::test]
    async fn test_missing_transport_degrades_to_local_only() {
        let recorder = Arc::new(Recorder::default());
        let store = CartStore::new(Arc::new(cartkit_store::MemoryBackend::new()));
        let engine =
            SyncEngine::new(store.clone(), SyncConfig::default()).with_observer(recorder.clone());

        engine.initialize().unwrap();

        assert!(engine.is_running());
        assert!(!engine.channel_available());
        assert_eq!(recorder.errors.lock().unwrap().len(), 1);
        assert!(recorder.errors.lock().unwrap()[0].contains("Sync transport unavailable"));

        store.add_item(&widget("x"), 1).unwrap();
        assert_eq!(store.get_state().len(), 1);
    }

    #[tokio::test]
    async fn test_shut_down_hub_degrades_to_local_only() {
        let hub = ChannelHub::new();
        hub.shutdown();

        let recorder = Arc::new(Recorder::default());
        let engine = SyncEngine::new(store_at(&ManualClock::at_millis(0)), SyncConfig::default())
            .with_hub(hub)
            .with_observer(recorder.clone());

        assert!(engine.initialize().is_ok());
        assert!(!engine.channel_available());
        assert_eq!(recorder.errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_initialize_twice_is_a_no_op() {
        let hub = ChannelHub::new();
        let store = store_at(&ManualClock::at_millis(0));
        let engine = SyncEngine::new(store.clone(), SyncConfig::default()).with_hub(hub);

        engine.initialize().unwrap();
        engine.initialize().unwrap();

        assert_eq!(store.subscriber_count(), 1);
        assert!(engine.channel_available());
    }

    #[tokio::test]
    async fn test_stop_ends_broadcasting() {
        let hub = ChannelHub::new();
        let clock = ManualClock::at_millis(1_000);
        let (a, b) = (store_at(&clock), store_at(&clock));

        let engine_a = SyncEngine::new(a.clone(), SyncConfig::default()).with_hub(hub.clone());
        let engine_b = SyncEngine::new(b.clone(), SyncConfig::default()).with_hub(hub.clone());
        engine_a.initialize().unwrap();
        engine_b.initialize().unwrap();

        engine_a.stop();
        engine_a.stop();

        assert!(!engine_a.is_running());
        assert!(!engine_a.channel_available());
        assert_eq!(a.subscriber_count(), 0);

        a.add_item(&widget("x"), 1).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.get_state().is_empty());
    }

    #[tokio::test]
    async fn test_channel_name_and_origin_isolate_carts() {
        let hub = ChannelHub::new();
        let clock = ManualClock::at_millis(1_000);
        let (a, b, c) = (store_at(&clock), store_at(&clock), store_at(&clock));

        let engine_a = SyncEngine::new(a.clone(), SyncConfig::default().origin("https://shop"))
            .with_hub(hub.clone());
        let engine_b = SyncEngine::new(b.clone(), SyncConfig::default().origin("https://blog"))
            .with_hub(hub.clone());
        let engine_c = SyncEngine::new(c.clone(), SyncConfig::default().channel_name("wishlist"))
            .with_hub(hub.clone());
        for engine in [&engine_a, &engine_b, &engine_c] {
            engine.initialize().unwrap();
        }

        a.add_item(&widget("x"), 1).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(b.get_state().is_empty());
        assert!(c.get_state().is_empty());
    }

    #[tokio::test]
    async fn test_storage_fallback_without_channel() {
        let shared = SessionStorage::new();
        let clock = ManualClock::at_millis(1_000);
        let open = |clock: &ManualClock| {
            let backend = StorageBackend::session(shared.clone(), "cart-state").unwrap();
            let clock: Arc<dyn Clock> = Arc::new(clock.clone());
            CartStore::with_options(StoreOptions::new(Arc::new(backend)).with_clock(clock))
        };
        let (a, b) = (open(&clock), open(&clock));

        let config = SyncConfig::default().storage_fallback(Duration::from_millis(10));
        let engine_a = SyncEngine::new(a.clone(), config.clone())
            .with_storage_fallback(Arc::new(shared.clone()), "cart-state");
        let engine_b = SyncEngine::new(b.clone(), config)
            .with_storage_fallback(Arc::new(shared.clone()), "cart-state");
        engine_a.initialize().unwrap();
        engine_b.initialize().unwrap();
        assert!(!engine_b.channel_available());

        a.add_item(&widget("x"), 4).unwrap();
        converged(&a, &b).await;
        assert_eq!(b.get_state().item_count(), 4);
    }

    #[test]
    fn test_initialize_needs_a_runtime() {
        let engine = SyncEngine::new(
            CartStore::new(Arc::new(cartkit_store::MemoryBackend::new())),
            SyncConfig::default(),
        );
        assert!(matches!(engine.initialize(), Err(SyncError::NoRuntime)));
        assert!(!engine.is_running());
    }
}
