//! Fan-out of cache updates to local listeners, with an optional transport
//! that carries them to other processes sharing the same content.

use crate::error::TransportError;
use crate::types::CacheUpdate;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

pub type Listener = Arc<dyn Fn(&CacheUpdate) + Send + Sync>;

type ListenerList = Mutex<Vec<(u64, Listener)>>;

/// A cache update tagged with the bus that published it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub origin: Uuid,
    pub update: CacheUpdate,
}

/// Carries envelopes to other processes. Fire-and-forget: no acknowledgement,
/// no ordering across processes.
pub trait Transport: Send + Sync {
    fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;
}

/// Applies an update received from another process to local state before
/// local listeners hear about it. Must not publish back onto the bus.
#[async_trait]
pub trait RemoteApplier: Send + Sync {
    async fn apply_remote(&self, update: &CacheUpdate);
}

pub struct BroadcastBus {
    id: Uuid,
    listeners: Arc<ListenerList>,
    next_listener: AtomicU64,
    transport: Mutex<Option<Arc<dyn Transport>>>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener: AtomicU64::new(1),
            transport: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.lock() = Some(transport);
    }

    /// Deliver to every current local listener, then hand off to the
    /// transport. Returns the number of local listeners that accepted it.
    pub fn publish(&self, update: CacheUpdate) -> usize {
        let delivered = self.deliver_local(&update);

        let transport = self.transport.lock().clone();
        if let Some(transport) = transport {
            let envelope = Envelope {
                origin: self.id,
                update,
            };
            if let Err(e) = transport.send(&envelope) {
                warn!(error = %e, "cross-process broadcast failed");
            }
        }
        delivered
    }

    /// Entry point for envelopes arriving from a transport. Our own
    /// publications are dropped.
    pub fn deliver_remote(&self, envelope: Envelope) -> usize {
        if envelope.origin == self.id {
            return 0;
        }
        self.deliver_local(&envelope.update)
    }

    /// Register a listener. It stays registered until the returned
    /// [`Subscription`] is dropped or explicitly unsubscribed.
    #[must_use = "dropping the subscription unsubscribes the listener"]
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&CacheUpdate) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn deliver_local(&self, update: &CacheUpdate) -> usize {
        // Snapshot so listeners may (un)subscribe while being called.
        let listeners: Vec<(u64, Listener)> = self.listeners.lock().clone();
        let mut delivered = 0;
        for (id, listener) in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener(update))) {
                Ok(()) => delivered += 1,
                Err(_) => warn!(listener = id, "cache update listener panicked"),
            }
        }
        debug!(
            content_type = %update.content_type,
            keys = ?update.keys,
            delivered,
            "cache update delivered"
        );
        delivered
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`BroadcastBus::subscribe`].
pub struct Subscription {
    id: u64,
    listeners: Weak<ListenerList>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work.
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// In-process channel transport
// ---------------------------------------------------------------------------

/// A broadcast hub shared by several buses. Envelopes travel JSON-encoded, as
/// they would over an OS pub/sub or message queue.
#[derive(Clone)]
pub struct ChannelTransport {
    sender: broadcast::Sender<String>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Route this hub's traffic into `bus` and the bus's publications into
    /// the hub. The returned task ends when the bus is dropped.
    pub fn attach(&self, bus: &Arc<BroadcastBus>) -> JoinHandle<()> {
        self.attach_with(bus, None)
    }

    /// Like [`attach`](Self::attach), but every foreign envelope is first
    /// handed to `applier` and only then delivered to local listeners.
    pub fn attach_with(
        &self,
        bus: &Arc<BroadcastBus>,
        applier: Option<Arc<dyn RemoteApplier>>,
    ) -> JoinHandle<()> {
        bus.set_transport(Arc::new(self.clone()));
        let own_id = bus.id();
        let mut rx = self.sender.subscribe();
        let bus = Arc::downgrade(bus);

        tokio::spawn(async move {
            loop {
                let raw = match rx.recv().await {
                    Ok(raw) => raw,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "cross-process receiver lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(bus) = bus.upgrade() else { break };
                match serde_json::from_str::<Envelope>(&raw) {
                    Ok(envelope) if envelope.origin == own_id => {}
                    Ok(envelope) => {
                        if let Some(applier) = &applier {
                            applier.apply_remote(&envelope.update).await;
                        }
                        bus.deliver_remote(envelope);
                    }
                    Err(e) => warn!(error = %e, "dropping undecodable envelope"),
                }
            }
        })
    }
}

impl Transport for ChannelTransport {
    fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let raw = serde_json::to_string(envelope)?;
        // No receivers is fine: nobody else is listening.
        let _ = self.sender.send(raw);
        Ok(())
    }
}
