//! # cartkit-store: Cart Store and Persistence
//!
//! The authoritative cart for one context, the backends that persist it,
//! the manager facade UI code talks to, and the snapshot history.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         cartkit Data Flow                               │
//! │                                                                         │
//! │  UI code                                                               │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  cartkit-store (THIS CRATE)                     │   │
//! │  │                                                                 │   │
//! │  │   ┌──────────────┐    ┌──────────────┐    ┌───────────────┐    │   │
//! │  │   │ CartManager  │───►│  CartStore   │───►│   Backend     │    │   │
//! │  │   │ (manager.rs) │    │  (store.rs)  │    │ (backend/*)   │    │   │
//! │  │   │ ErrorReport  │    │ subscribers  │    │ memory, file, │    │   │
//! │  │   └──────────────┘    └──────┬───────┘    │ session,      │    │   │
//! │  │                              │            │ sqlite, remote│    │   │
//! │  │   ┌──────────────┐           │            └───────────────┘    │   │
//! │  │   │HistoryEngine │◄── get_state / replay                       │   │
//! │  │   │ (history.rs) │                                              │   │
//! │  │   └──────────────┘                                              │   │
//! │  └──────────────────────────────┬──────────────────────────────────┘   │
//! │                                 │ subscribe / replay                    │
//! │                                 ▼                                       │
//! │                          cartkit-sync (other contexts)                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`store`] - The cart store and its subscriptions
//! - [`backend`] - Persistence backends
//! - [`manager`] - Backend selection and error reporting
//! - [`history`] - Bounded snapshot history
//! - [`config`] - `cartkit.toml` storage settings
//! - [`migrations`] - Embedded SQLite migrations
//! - [`error`] / [`report`] - Error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cartkit_store::{CartManager, ManagerOptions};
//!
//! let manager = CartManager::new(
//!     ManagerOptions::default()
//!         .persist(true)
//!         .on_error(|report| eprintln!("{}", report)),
//! )?;
//!
//! let _sub = manager.subscribe(|state| render(state));
//! manager.add_item(&product, 2)?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod backend;
pub mod config;
pub mod error;
pub mod history;
pub mod manager;
pub mod migrations;
pub mod report;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use backend::{
    Backend, BackendKind, ErrorCallback, FileStorage, KeyValueStorage, MemoryBackend,
    RemoteBackend, RemoteConfig, SaveMethod, SessionStorage, SqliteBackend, SqliteConfig,
    StorageBackend,
};
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use history::{HistoryConfig, HistoryEngine};
pub use manager::{CartManager, ManagerOptions, ReportCallback};
pub use report::{ErrorCode, ErrorReport};
pub use store::{CartStore, ReplayOutcome, StoreOptions, Subscription};
