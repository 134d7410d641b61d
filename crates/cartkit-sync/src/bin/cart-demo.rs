//! # cart-demo
//!
//! Two simulated contexts sharing one channel hub.
//!
//! ```text
//!   context A ── add, add ──► hub ──► context B ── snapshot, remove, restore
//! ```
//!
//! Reads `cartkit.toml` (or the path given as the first argument) for the
//! storage and sync sections. `RUST_LOG` controls logging.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cartkit_core::{CartState, Money, Product};
use cartkit_store::{BackendKind, CartManager, ErrorReport, HistoryEngine, StoreConfig};
use cartkit_sync::{ChannelHub, SyncConfig, SyncEngine, SyncError, SyncObserver};

/// Logs what a context's engine does in the background.
struct LogObserver {
    context: &'static str,
}

impl SyncObserver for LogObserver {
    fn on_remote_applied(&self, state: &CartState) {
        info!(
            context = self.context,
            items = state.len(),
            total = %state.total(),
            "Adopted remote cart"
        );
    }

    fn on_error(&self, error: &SyncError) {
        warn!(context = self.context, error = %error, "Sync problem");
    }
}

struct DemoContext {
    name: &'static str,
    manager: CartManager,
    engine: SyncEngine,
}

async fn open_context(
    name: &'static str,
    store_config: &StoreConfig,
    sync_config: &SyncConfig,
    hub: &ChannelHub,
) -> Result<DemoContext> {
    let manager = CartManager::from_config(store_config)
        .await
        .with_context(|| format!("creating cart manager for {}", name))?;
    manager.set_error_callback(Some(Arc::new(move |report: &ErrorReport| {
        warn!(context = name, "{}", report);
    })));

    let mut engine = SyncEngine::new(manager.store(), sync_config.clone())
        .with_hub(hub.clone())
        .with_observer(Arc::new(LogObserver { context: name }));

    // Only file storage is visible to both contexts.
    if sync_config.storage_fallback && store_config.storage.kind == BackendKind::File {
        engine = engine.with_storage_fallback(
            Arc::new(store_config.file_storage()?),
            store_config.storage.key.clone(),
        );
    }

    engine.initialize()?;
    Ok(DemoContext {
        name,
        manager,
        engine,
    })
}

/// Waits until both contexts hold the same cart.
async fn converge(a: &DemoContext, b: &DemoContext) -> Result<CartState> {
    for _ in 0..50 {
        let state = a.manager.get_state();
        if state == b.manager.get_state() {
            info!(
                contexts = %format!("{}+{}", a.name, b.name),
                items = state.len(),
                item_count = state.item_count(),
                total = %state.total(),
                "Contexts converged"
            );
            return Ok(state);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("{} and {} did not converge within 1s", a.name, b.name)
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cartkit=debug,sqlx=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let store_config = StoreConfig::load(config_path.clone()).context("loading store config")?;
    let sync_config = SyncConfig::load(config_path).context("loading sync config")?;

    info!(
        backend = %store_config.storage.kind,
        channel = %sync_config.channel_name,
        "Starting cart demo"
    );

    let hub = ChannelHub::new();
    let a = open_context("A", &store_config, &sync_config, &hub).await?;
    let b = open_context("B", &store_config, &sync_config, &hub).await?;

    let history = HistoryEngine::new(store_config.history_config(), None)?;

    // Empty, then the same widget twice: one line, quantity 5.
    let widget = Product::new("1", "Widget", Money::from_cents(10));
    a.manager.add_item(&widget, 2)?;
    a.manager.add_item(&widget, 3)?;

    let state = converge(&a, &b).await?;
    let snapshot = history.add_state(&state, Some("two adds".into()), None);

    let item_id = match b.manager.get_state().find_by_product("1") {
        Some(item) => item.id.clone(),
        None => bail!("context B never received the widget"),
    };

    // An emptier cart is never newer, so A keeps its line.
    b.manager.update_quantity(&item_id, 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!(
        a_items = a.manager.get_state().len(),
        b_items = b.manager.get_state().len(),
        "Removal stayed local to B"
    );

    // Undo the removal on B from its snapshot.
    let restored = history
        .restore_state(&snapshot.id)
        .context("snapshot missing from history")?;
    b.manager.store().replay(restored.items());
    let state = converge(&a, &b).await?;

    info!(
        history_entries = history.len(),
        item_count = state.item_count(),
        total = %state.total(),
        "Demo finished"
    );

    a.engine.stop();
    b.engine.stop();
    hub.shutdown();
    Ok(())
}
