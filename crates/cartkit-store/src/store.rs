//! # Cart Store
//!
//! The single writer of cart state for one context.
//!
//! ## Mutation Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  add_item / remove_item / update_quantity / clear / replay              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌───────────────────── state lock ──────────────────────┐              │
//! │  │  validate ──► mutate items ──► snapshot ──► save()    │              │
//! │  └────────────────────────────────────────────┬──────────┘              │
//! │                                               │                         │
//! │       save failed? ──► warn! + error callback │ (mutation is kept)      │
//! │                                               ▼                         │
//! │  ┌──────────────────── lock released ────────────────────┐              │
//! │  │  for each subscriber, in subscription order:          │              │
//! │  │      catch_unwind(|| callback(&snapshot))             │              │
//! │  └───────────────────────────────────────────────────────┘              │
//! │                                                                         │
//! │  Subscribers may call back into the store from their callback.         │
//! │  replay applies every step inside one lock, then publishes each.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity Rule
//! Two lines never share a `product.id`. Adding a product that is already in
//! the cart increments the existing line's quantity.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info, warn};

use cartkit_core::validation::{validate_product, validate_quantity};
use cartkit_core::{CartItem, CartState, Clock, Product, SystemClock};

use crate::backend::{Backend, BackendKind, ErrorCallback, ErrorSlot, MemoryBackend};
use crate::error::{StoreError, StoreResult};

/// Receives every new cart state.
pub type StateCallback = Arc<dyn Fn(&CartState) + Send + Sync>;

// =============================================================================
// Options
// =============================================================================

/// Construction options for [`CartStore`].
pub struct StoreOptions {
    pub backend: Arc<dyn Backend>,

    /// Source of `addedAt` for new lines. Default: [`SystemClock`]
    pub clock: Arc<dyn Clock>,

    /// Receives persistence failures; the mutation itself still succeeds.
    pub on_persistence_error: Option<ErrorCallback>,
}

impl StoreOptions {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        StoreOptions {
            backend,
            clock: Arc::new(SystemClock),
            on_persistence_error: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn on_persistence_error(mut self, callback: ErrorCallback) -> Self {
        self.on_persistence_error = Some(callback);
        self
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }
}

// =============================================================================
// Store Internals
// =============================================================================

struct StoreState {
    items: Vec<CartItem>,
    backend: Arc<dyn Backend>,
}

#[derive(Default)]
struct SubscriberRegistry {
    next_id: u64,
    entries: Vec<(u64, StateCallback)>,
}

struct StoreInner {
    state: Mutex<StoreState>,
    subscribers: Mutex<SubscriberRegistry>,
    errors: ErrorSlot,
    clock: Arc<dyn Clock>,
}

impl StoreInner {
    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscribers(&self) -> MutexGuard<'_, SubscriberRegistry> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn unsubscribe(&self, id: u64) -> bool {
        let mut registry = self.lock_subscribers();
        let before = registry.entries.len();
        registry.entries.retain(|(entry_id, _)| *entry_id != id);
        registry.entries.len() != before
    }
}

/// What [`CartStore::replay_if_newer`] did with a remote cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Not newer than the local cart; discarded.
    Stale,
    /// Same items as the local cart; nothing to do.
    Unchanged,
    /// Local cart replaced by the remote one.
    Applied,
}

/// Outcome of a locked mutation: the state to publish plus any save failure.
struct Commit {
    snapshot: CartState,
    failure: Option<StoreError>,
}

// =============================================================================
// Cart Store
// =============================================================================

/// Handle to one context's cart. Clones share the same cart.
///
/// ## Example
/// ```rust,ignore
/// let store = CartStore::new(Arc::new(MemoryBackend::new()));
/// let _sub = store.subscribe(|state| println!("{} items", state.item_count()));
/// store.add_item(&Product::new("1", "Widget", Money::from_cents(1000)), 2)?;
/// ```
#[derive(Clone)]
pub struct CartStore {
    inner: Arc<StoreInner>,
}

impl CartStore {
    /// Store over `backend`, initial items loaded from it.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self::with_options(StoreOptions::new(backend))
    }

    pub fn with_options(options: StoreOptions) -> Self {
        let errors = ErrorSlot::default();
        errors.set(options.on_persistence_error);
        attach_error_slot(options.backend.as_ref(), &errors);

        let (items, failure) = load_items(options.backend.as_ref());
        info!(
            backend = %options.backend.kind(),
            items = items.len(),
            "Cart store created"
        );

        let store = CartStore {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState {
                    items,
                    backend: options.backend,
                }),
                subscribers: Mutex::new(SubscriberRegistry::default()),
                errors,
                clock: options.clock,
            }),
        };
        store.report(failure, "load");
        store
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// An owned copy of the current cart.
    pub fn get_state(&self) -> CartState {
        CartState::from_items(self.inner.lock_state().items.clone())
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.lock_state().backend.kind()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock_subscribers().entries.len()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Adds `quantity` of `product`, merging into an existing line.
    ///
    /// ## Errors
    /// - `InvalidQuantity` if `quantity < 1` (nothing changes)
    /// - `InvalidProduct` if the product has an empty id or negative price
    ///
    /// Persistence failures are NOT returned; see the module docs.
    pub fn add_item(&self, product: &Product, quantity: i64) -> StoreResult<()> {
        validate_quantity(quantity)?;
        validate_product(product)?;

        let commit = {
            let mut state = self.inner.lock_state();
            let item = CartItem::new(product.clone(), quantity, self.inner.clock.now());
            insert_item(&mut state.items, item);
            save_locked(&state)
        };

        debug!(product_id = %product.id, quantity, "Item added");
        self.publish(commit, "addItem");
        Ok(())
    }

    /// Removes a line. Unknown ids are ignored.
    pub fn remove_item(&self, item_id: &str) {
        let commit = {
            let mut state = self.inner.lock_state();
            let Some(position) = state.items.iter().position(|item| item.id == item_id) else {
                debug!(item_id, "remove_item: no such line");
                return;
            };
            state.items.remove(position);
            save_locked(&state)
        };

        debug!(item_id, "Item removed");
        self.publish(commit, "removeItem");
    }

    /// Sets a line's quantity. `quantity <= 0` removes the line.
    pub fn update_quantity(&self, item_id: &str, quantity: i64) {
        if quantity <= 0 {
            self.remove_item(item_id);
            return;
        }

        let commit = {
            let mut state = self.inner.lock_state();
            let Some(item) = state.items.iter_mut().find(|item| item.id == item_id) else {
                debug!(item_id, "update_quantity: no such line");
                return;
            };
            item.quantity = quantity;
            save_locked(&state)
        };

        debug!(item_id, quantity, "Quantity updated");
        self.publish(commit, "updateQuantity");
    }

    /// Empties the cart and clears the persisted record.
    pub fn clear(&self) {
        let commit = {
            let mut state = self.inner.lock_state();
            state.items.clear();
            clear_locked(&state)
        };

        debug!("Cart cleared");
        self.publish(commit, "clear");
    }

    /// Clears the cart, then re-inserts `items` one by one.
    ///
    /// Item ids and `addedAt` are kept. Each step persists and notifies, as
    /// the equivalent sequence of `clear` and `add_item` calls would. Lines
    /// with a quantity below 1 are skipped.
    ///
    /// All steps are applied under one lock before any subscriber runs, so
    /// no other mutation lands between them. A mutation made from a
    /// subscriber callback applies on top of the fully replayed cart.
    pub fn replay(&self, items: &[CartItem]) {
        let commits = {
            let mut state = self.inner.lock_state();
            replay_locked(&mut state, items)
        };

        debug!(items = items.len(), "Cart replayed");
        self.publish_all(commits);
    }

    /// Replays `remote` only if it differs from the local cart and is newer.
    ///
    /// The comparison and the replay run under the same lock, so a local
    /// mutation can never interleave with them. Timestamps are derived from
    /// the items on both sides.
    pub fn replay_if_newer(&self, remote: &CartState) -> ReplayOutcome {
        let commits = {
            let mut state = self.inner.lock_state();
            if state.items.as_slice() == remote.items() {
                return ReplayOutcome::Unchanged;
            }

            let local_timestamp = latest_added_at(&state.items);
            if remote.timestamp() <= local_timestamp {
                debug!(
                    remote_timestamp = remote.timestamp(),
                    local_timestamp,
                    "Discarding stale remote cart"
                );
                return ReplayOutcome::Stale;
            }
            replay_locked(&mut state, remote.items())
        };

        debug!(items = remote.len(), "Cart replayed");
        self.publish_all(commits);
        ReplayOutcome::Applied
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Registers `callback` and immediately calls it with the current state.
    ///
    /// Dropping the returned [`Subscription`] does not unsubscribe.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&CartState) + Send + Sync + 'static,
    {
        let callback: StateCallback = Arc::new(callback);
        let id = {
            let mut registry = self.inner.lock_subscribers();
            registry.next_id += 1;
            let id = registry.next_id;
            registry.entries.push((id, Arc::clone(&callback)));
            id
        };

        debug!(subscriber = id, "Subscriber added");
        invoke(id, &callback, &self.get_state());

        Subscription {
            id,
            store: Arc::downgrade(&self.inner),
            active: AtomicBool::new(true),
        }
    }

    // =========================================================================
    // Backend Management
    // =========================================================================

    /// Replaces the backend, loads its state and notifies subscribers.
    pub fn set_backend(&self, backend: Arc<dyn Backend>) {
        let previous = Arc::clone(&self.inner.lock_state().backend);
        previous.set_error_callback(None);
        attach_error_slot(backend.as_ref(), &self.inner.errors);
        let (items, failure) = load_items(backend.as_ref());

        let snapshot = {
            let mut state = self.inner.lock_state();
            state.backend = backend;
            state.items = items;
            CartState::from_items(state.items.clone())
        };

        info!(backend = %self.backend_kind(), "Cart backend replaced");
        self.publish(Commit { snapshot, failure }, "load");
    }

    /// Reloads the state from the current backend and notifies subscribers.
    ///
    /// Useful once an asynchronous backend has finished its first fetch.
    pub fn reload(&self) {
        let commit = {
            let mut state = self.inner.lock_state();
            let (items, failure) = load_items(state.backend.as_ref());
            state.items = items;
            Commit {
                snapshot: CartState::from_items(state.items.clone()),
                failure,
            }
        };
        self.publish(commit, "load");
    }

    /// Drops every subscriber and reloads from the backend.
    ///
    /// Must not be called from inside a subscriber callback.
    pub fn reset(&self) {
        self.inner.lock_subscribers().entries.clear();

        let failure = {
            let mut state = self.inner.lock_state();
            let (items, failure) = load_items(state.backend.as_ref());
            state.items = items;
            failure
        };
        self.report(failure, "load");
        debug!("Cart store reset");
    }

    /// Replaces the persistence error callback.
    pub fn set_error_callback(&self, callback: Option<ErrorCallback>) {
        self.inner.errors.set(callback);
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    fn publish(&self, commit: Commit, operation: &'static str) {
        self.report(commit.failure, operation);
        self.notify(&commit.snapshot);
    }

    fn publish_all(&self, commits: Vec<(Commit, &'static str)>) {
        for (commit, operation) in commits {
            self.publish(commit, operation);
        }
    }

    fn report(&self, failure: Option<StoreError>, operation: &'static str) {
        if let Some(err) = failure {
            warn!(operation, error = %err, "Cart persistence failed");
            self.inner.errors.report(&err);
        }
    }

    fn notify(&self, snapshot: &CartState) {
        let subscribers: Vec<(u64, StateCallback)> = self
            .inner
            .lock_subscribers()
            .entries
            .iter()
            .map(|(id, callback)| (*id, Arc::clone(callback)))
            .collect();

        for (id, callback) in &subscribers {
            invoke(*id, callback, snapshot);
        }
    }
}

impl std::fmt::Debug for CartStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("CartStore")
            .field("backend", &state.backend.kind())
            .field("items", &state.items.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Handle returned by [`CartStore::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    store: Weak<StoreInner>,
    active: AtomicBool,
}

impl Subscription {
    /// Stops delivery. Calling it again does nothing.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(store) = self.store.upgrade() {
            if store.unsubscribe(self.id) {
                debug!(subscriber = self.id, "Subscriber removed");
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for StoreInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreInner").finish_non_exhaustive()
    }
}

// =============================================================================
// Free Helpers
// =============================================================================

/// Identity rule: one line per product id.
fn insert_item(items: &mut Vec<CartItem>, item: CartItem) {
    match items
        .iter_mut()
        .find(|existing| existing.product.id == item.product.id)
    {
        Some(existing) => existing.quantity = existing.quantity.saturating_add(item.quantity),
        None => items.push(item),
    }
}

fn save_locked(state: &StoreState) -> Commit {
    let snapshot = CartState::from_items(state.items.clone());
    let failure = state.backend.save(&snapshot).err();
    Commit { snapshot, failure }
}

fn clear_locked(state: &StoreState) -> Commit {
    Commit {
        snapshot: CartState::empty(),
        failure: state.backend.clear().err(),
    }
}

/// Clear plus one insert per replayable line, persisting after each step.
fn replay_locked(state: &mut StoreState, items: &[CartItem]) -> Vec<(Commit, &'static str)> {
    state.items.clear();
    let mut commits = vec![(clear_locked(state), "clear")];

    for item in items {
        if validate_quantity(item.quantity).is_err() {
            debug!(item_id = %item.id, quantity = item.quantity, "Skipping unreplayable line");
            continue;
        }
        insert_item(&mut state.items, item.clone());
        commits.push((save_locked(state), "replay"));
    }
    commits
}

fn latest_added_at(items: &[CartItem]) -> i64 {
    items
        .iter()
        .map(|item| item.added_at.timestamp_millis())
        .max()
        .unwrap_or(0)
}

fn load_items(backend: &dyn Backend) -> (Vec<CartItem>, Option<StoreError>) {
    match backend.load() {
        Ok(Some(state)) => (state.into_items(), None),
        Ok(None) => (Vec::new(), None),
        Err(e) => (Vec::new(), Some(e)),
    }
}

/// Routes an asynchronous backend's late failures into the store's slot.
fn attach_error_slot(backend: &dyn Backend, errors: &ErrorSlot) {
    let slot = errors.clone();
    backend.set_error_callback(Some(Arc::new(move |err: &StoreError| {
        warn!(error = %err, "Background cart persistence failed");
        slot.report(err);
    })));
}

fn invoke(id: u64, callback: &StateCallback, snapshot: &CartState) {
    if catch_unwind(AssertUnwindSafe(|| callback(snapshot))).is_err() {
        warn!(subscriber = id, "Cart subscriber panicked");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
