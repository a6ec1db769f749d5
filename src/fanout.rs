//! Realtime fan-out of change events.
//!
//! Publishing is best-effort and never blocks: events go to whoever is
//! subscribed to the tenant's channel at that moment, and are dropped when
//! nobody is listening or a subscriber has fallen too far behind. Clients
//! recover anything they missed from the change feed.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::broadcast;

use crate::models::ChangeEvent;

/// Default per-tenant channel buffer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Publish/subscribe seam between persistence and transport.
pub trait EventBus: Send + Sync {
    /// Publishes an event to the tenant named in the event. Must not block
    /// and must not fail the caller.
    fn publish(&self, event: ChangeEvent);

    /// Subscribes to a tenant's events.
    fn subscribe(&self, tenant_id: &str) -> broadcast::Receiver<ChangeEvent>;

    /// Number of live subscribers for a tenant.
    fn subscriber_count(&self, tenant_id: &str) -> usize;
}

/// In-process hub with one broadcast channel per tenant.
pub struct SyncHub {
    channels: RwLock<HashMap<String, broadcast::Sender<ChangeEvent>>>,
    capacity: usize,
}

impl SyncHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }
}

impl Default for SyncHub {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for SyncHub {
    fn publish(&self, event: ChangeEvent) {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);

        if let Some(sender) = channels.get(&event.tenant_id) {
            // Ignore send errors (no subscribers)
            let _ = sender.send(event);
        }
    }

    fn subscribe(&self, tenant_id: &str) -> broadcast::Receiver<ChangeEvent> {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        // Drop channels whose subscribers have all gone.
        channels.retain(|_, sender| sender.receiver_count() > 0);

        if let Some(sender) = channels.get(tenant_id) {
            sender.subscribe()
        } else {
            let (sender, receiver) = broadcast::channel(self.capacity);
            channels.insert(tenant_id.to_string(), sender);
            receiver
        }
    }

    fn subscriber_count(&self, tenant_id: &str) -> usize {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        channels
            .get(tenant_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}
