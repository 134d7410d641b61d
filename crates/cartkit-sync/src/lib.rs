//! # cartkit-sync: Cross-Context Cart Sync
//!
//! Propagates each context's cart to the other contexts of the same origin
//! and reconciles what arrives into the local [`cartkit_store::CartStore`].
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Sync Architecture                              │
//! │                                                                         │
//! │   Context A                                      Context B              │
//! │  ┌──────────────┐                              ┌──────────────┐         │
//! │  │  CartStore   │                              │  CartStore   │         │
//! │  └──┬───────▲───┘                              └───▲───────┬──┘         │
//! │     │notify │replay                          replay│       │notify      │
//! │  ┌──▼───────┴───┐      cart-update (JSON)     ┌───┴───────▼──┐         │
//! │  │  SyncEngine  │◄───────────────────────────►│  SyncEngine  │         │
//! │  └──────┬───────┘        ChannelHub           └──────┬───────┘         │
//! │         │               (origin, name)               │                  │
//! │         │                                            │                  │
//! │         └──────► shared storage record ◄─────────────┘                  │
//! │                  (StorageWatcher fallback)                              │
//! │                                                                         │
//! │  Conflict resolution: the cart whose newest line was added last wins   │
//! │  entirely. There is no per-item merge.                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`engine`] - `SyncEngine`, reconciliation, observers
//! - [`transport`] - `ChannelHub` and broadcast channels
//! - [`watcher`] - Storage marker polling fallback
//! - [`protocol`] - The `cart-update` message
//! - [`config`] - `[sync]` settings
//! - [`error`] - Error types

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod watcher;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::SyncConfig;
pub use engine::{NoOpObserver, ReconcileOutcome, SyncEngine, SyncObserver};
pub use error::{SyncError, SyncResult};
pub use protocol::CartMessage;
pub use transport::{BroadcastChannel, ChannelHub, ChannelReceiver};
pub use watcher::StorageWatcher;
