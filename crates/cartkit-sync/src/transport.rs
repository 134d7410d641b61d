//! # Broadcast Transport
//!
//! Named, origin-scoped pub/sub channels between contexts of one process.
//!
//! ## Channel Topology
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            ChannelHub                                   │
//! │                                                                         │
//! │   ("https://shop", "cart-sync") ──► broadcast::Sender<Envelope>         │
//! │          ▲            ▲            ▲                                    │
//! │          │            │            │                                    │
//! │     context A    context B    context C      (one BroadcastChannel each)│
//! │                                                                         │
//! │   ("https://blog", "cart-sync") ──► separate sender, never crosses     │
//! │                                                                         │
//! │   post() from A is delivered to B and C, never back to A.              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Payloads travel as JSON text so every receiver parses exactly what a
//! peer in another process would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DEFAULT_ORIGIN;
use crate::error::{SyncError, SyncResult};
use crate::protocol::CartMessage;

/// Buffered messages per channel before slow receivers start lagging.
const CHANNEL_CAPACITY: usize = 64;

/// One posted message as seen by receivers.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender_id: String,
    pub payload: String,
}

#[derive(Debug, Default)]
struct Registry {
    channels: HashMap<(String, String), broadcast::Sender<Envelope>>,
    closed: bool,
}

// =============================================================================
// Channel Hub
// =============================================================================

/// Registry of broadcast channels. Clones share the registry.
#[derive(Debug, Clone)]
pub struct ChannelHub {
    registry: Arc<Mutex<Registry>>,
    origin: String,
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelHub {
    pub fn new() -> Self {
        ChannelHub {
            registry: Arc::new(Mutex::new(Registry::default())),
            origin: DEFAULT_ORIGIN.to_string(),
        }
    }

    /// A view of the same registry scoped to `origin`.
    pub fn for_origin(&self, origin: impl Into<String>) -> Self {
        ChannelHub {
            registry: Arc::clone(&self.registry),
            origin: origin.into(),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Opens `name` under this hub's origin with a fresh sender id.
    pub fn open(&self, name: &str) -> SyncResult<BroadcastChannel> {
        if name.trim().is_empty() {
            return Err(SyncError::SyncTransportUnavailable(
                "channel name cannot be empty".into(),
            ));
        }

        let mut registry = self.lock();
        if registry.closed {
            return Err(SyncError::SyncTransportUnavailable(
                "channel hub is shut down".into(),
            ));
        }

        let tx = registry
            .channels
            .entry((self.origin.clone(), name.to_string()))
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();

        let channel = BroadcastChannel {
            name: name.to_string(),
            origin: self.origin.clone(),
            sender_id: Uuid::new_v4().to_string(),
            tx,
            hub: self.clone(),
            closed: AtomicBool::new(false),
        };

        debug!(
            channel = %channel.name,
            origin = %channel.origin,
            sender_id = %channel.sender_id,
            "Broadcast channel opened"
        );
        Ok(channel)
    }

    /// Refuses further `open` calls and drops every registered sender.
    pub fn shutdown(&self) {
        let mut registry = self.lock();
        if !registry.closed {
            registry.closed = true;
            registry.channels.clear();
            info!("Channel hub shut down");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// Broadcast Channel
// =============================================================================

/// One context's handle on a named channel.
#[derive(Debug)]
pub struct BroadcastChannel {
    name: String,
    origin: String,
    sender_id: String,
    tx: broadcast::Sender<Envelope>,
    hub: ChannelHub,
    closed: AtomicBool,
}

impl BroadcastChannel {
    /// Publishes `message` to every other handle on this channel.
    ///
    /// Having no listeners is not an error.
    pub fn post(&self, message: &CartMessage) -> SyncResult<()> {
        if self.is_closed() {
            return Err(SyncError::ChannelClosed(self.name.clone()));
        }

        let envelope = Envelope {
            sender_id: self.sender_id.clone(),
            payload: message.encode()?,
        };

        match self.tx.send(envelope) {
            Ok(receivers) => {
                debug!(channel = %self.name, receivers, "Cart update posted");
            }
            Err(_) => {
                debug!(channel = %self.name, "Cart update posted with no listeners");
            }
        }
        Ok(())
    }

    /// Starts receiving messages posted after this call.
    pub fn subscribe(&self) -> ChannelReceiver {
        ChannelReceiver {
            name: self.name.clone(),
            sender_id: self.sender_id.clone(),
            rx: self.tx.subscribe(),
        }
    }

    /// Stops posting from this handle. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(channel = %self.name, sender_id = %self.sender_id, "Broadcast channel closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.hub.is_shutdown()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }
}

// =============================================================================
// Channel Receiver
// =============================================================================

/// Receiving side of a [`BroadcastChannel`]; skips the owner's own posts.
#[derive(Debug)]
pub struct ChannelReceiver {
    name: String,
    sender_id: String,
    rx: broadcast::Receiver<Envelope>,
}

impl ChannelReceiver {
    /// Waits for the next payload posted by another handle.
    pub async fn recv(&mut self) -> SyncResult<String> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.sender_id == self.sender_id => continue,
                Ok(envelope) => return Ok(envelope.payload),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.name, skipped, "Receiver lagged, dropping old updates");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SyncError::ChannelClosed(self.name.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cartkit_core::CartState;
    use std::time::Duration;
    use tokio::time::timeout;

    fn message() -> CartMessage {
        CartMessage::cart_update(&CartState::empty())
    }

    #[tokio::test]
    async fn test_post_reaches_peers_not_self() {
        let hub = ChannelHub::new();
        let a = hub.open("cart-sync").unwrap();
        let b = hub.open("cart-sync").unwrap();
        let mut a_rx = a.subscribe();
        let mut b_rx = b.subscribe();

        a.post(&message()).unwrap();

        let payload = timeout(Duration::from_secs(1), b_rx.recv()).await.unwrap().unwrap();
        assert_eq!(CartMessage::decode(&payload).unwrap(), message());

        assert!(timeout(Duration::from_millis(50), a_rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_channels_are_scoped_by_name_and_origin() {
        let hub = ChannelHub::new();
        let shop = hub.for_origin("https://shop");
        let blog = hub.for_origin("https://blog");

        let sender = shop.open("cart-sync").unwrap();
        let mut other_name = shop.open("wishlist").unwrap().subscribe();
        let mut other_origin = blog.open("cart-sync").unwrap().subscribe();
        let mut same = shop.open("cart-sync").unwrap().subscribe();

        sender.post(&message()).unwrap();

        assert!(timeout(Duration::from_secs(1), same.recv()).await.unwrap().is_ok());
        assert!(timeout(Duration::from_millis(50), other_name.recv()).await.is_err());
        assert!(timeout(Duration::from_millis(50), other_origin.recv()).await.is_err());
    }

    #[test]
    fn test_post_without_listeners_is_ok() {
        let hub = ChannelHub::new();
        let channel = hub.open("cart-sync").unwrap();
        assert!(channel.post(&message()).is_ok());
    }

    #[test]
    fn test_open_failures() {
        let hub = ChannelHub::new();
        assert!(matches!(
            hub.open(" "),
            Err(SyncError::SyncTransportUnavailable(_))
        ));

        let channel = hub.open("cart-sync").unwrap();
        hub.for_origin("elsewhere").shutdown();

        assert!(hub.is_shutdown());
        assert!(matches!(
            hub.open("cart-sync"),
            Err(SyncError::SyncTransportUnavailable(_))
        ));
        assert!(matches!(
            channel.post(&message()),
            Err(SyncError::ChannelClosed(_))
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let hub = ChannelHub::new();
        let channel = hub.open("cart-sync").unwrap();

        channel.close();
        channel.close();

        assert!(channel.is_closed());
        assert!(matches!(
            channel.post(&message()),
            Err(SyncError::ChannelClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_receiver_ends_when_every_sender_is_gone() {
        let hub = ChannelHub::new();
        let channel = hub.open("cart-sync").unwrap();
        let mut rx = channel.subscribe();

        hub.shutdown();
        drop(channel);

        let result = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert!(matches!(result, Err(SyncError::ChannelClosed(_))));
    }
}
