//! Typed event bus for intra-node notifications.
//!
//! Components emit [`DealUpdated`], [`ShardReady`] and [`ShardFailed`]
//! through a shared [`EventBus`]; the daemon and tests subscribe to the types
//! they care about. Each event type gets its own broadcast channel, created
//! lazily on first `subscribe()`.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::warn;

use crate::{DealStatus, ProviderDealIdentifier, ShardKey};

/// Marker trait for all events that can travel through the [`EventBus`].
pub trait Event: Any + Send + Sync + Clone + std::fmt::Debug + 'static {}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A retrieval deal record was persisted with a new state.
#[derive(Clone, Debug)]
pub struct DealUpdated {
    pub deal: ProviderDealIdentifier,
    /// Status the deal was saved with.
    pub status: DealStatus,
    pub message: String,
}
impl Event for DealUpdated {}

/// A shard finished initializing and can be acquired.
#[derive(Clone, Debug)]
pub struct ShardReady {
    pub key: ShardKey,
}
impl Event for ShardReady {}

/// A shard entered the `Errored` state.
#[derive(Clone, Debug)]
pub struct ShardFailed {
    pub key: ShardKey,
    /// Same text as the shard record's `last_error`.
    pub error: String,
}
impl Event for ShardFailed {}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

const CHANNEL_CAPACITY: usize = 256;

type Channels = HashMap<TypeId, Box<dyn Any + Send + Sync>>;

/// Shared, clonable pub/sub hub keyed by event type.
///
/// Emitting never blocks. Events emitted before anyone subscribed to their
/// type are dropped.
#[derive(Clone, Default)]
pub struct EventBus {
    channels: Arc<Mutex<Channels>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every live subscriber of `E`.
    pub fn emit<E: Event>(&self, event: E) {
        let channels = self.channels.lock().expect("event bus lock poisoned");
        if let Some(tx) = channels
            .get(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast_ref::<broadcast::Sender<E>>())
        {
            // Err only means every receiver is gone.
            let _ = tx.send(event);
        }
    }

    /// Start receiving events of type `E` emitted from now on.
    pub fn subscribe<E: Event>(&self) -> EventReceiver<E> {
        let mut channels = self.channels.lock().expect("event bus lock poisoned");
        let entry = channels.entry(TypeId::of::<E>()).or_insert_with(|| {
            let (tx, _) = broadcast::channel::<E>(CHANNEL_CAPACITY);
            Box::new(tx)
        });
        let tx = entry
            .downcast_ref::<broadcast::Sender<E>>()
            .expect("event bus channel registered under the wrong type");
        EventReceiver { rx: tx.subscribe() }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels = self.channels.lock().expect("event bus lock poisoned");
        f.debug_struct("EventBus")
            .field("event_types", &channels.len())
            .finish()
    }
}

/// Receiving half for one event type.
pub struct EventReceiver<E: Event> {
    rx: broadcast::Receiver<E>,
}

impl<E: Event> EventReceiver<E> {
    /// Next event, or `None` once every bus handle is dropped. Lagged
    /// events are skipped.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, event = std::any::type_name::<E>(), "event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DealId, PeerId};

    fn deal_event(n: u64, status: DealStatus) -> DealUpdated {
        DealUpdated {
            deal: ProviderDealIdentifier {
                receiver: PeerId::from([1u8; 32]),
                deal_id: DealId(n),
            },
            status,
            message: String::new(),
        }
    }

    #[tokio::test]
    async fn test_emit_subscribe_basic() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe::<DealUpdated>();

        bus.emit(deal_event(1, DealStatus::Accepted));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.deal.deal_id, DealId(1));
        assert_eq!(event.status, DealStatus::Accepted);
    }

    #[tokio::test]
    async fn test_event_types_independent() {
        let bus = EventBus::new();
        let mut deals = bus.subscribe::<DealUpdated>();
        let mut failures = bus.subscribe::<ShardFailed>();

        bus.emit(ShardFailed {
            key: ShardKey::new("abc"),
            error: "boom".into(),
        });
        bus.emit(deal_event(2, DealStatus::Ongoing));

        let failed = failures.recv().await.unwrap();
        assert_eq!(failed.key, ShardKey::new("abc"));
        assert_eq!(failed.error, "boom");
        assert_eq!(deals.recv().await.unwrap().deal.deal_id, DealId(2));
    }

    #[tokio::test]
    async fn test_emit_without_subscriber_does_not_block() {
        let bus = EventBus::new();
        bus.emit(ShardReady {
            key: ShardKey::new("orphan"),
        });

        let rx = bus.subscribe::<ShardReady>();
        drop(rx);
        bus.emit(ShardReady {
            key: ShardKey::new("orphan"),
        });
    }

    #[tokio::test]
    async fn test_clone_shares_channels() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe::<DealUpdated>();
        bus.clone().emit(deal_event(3, DealStatus::Completed));
        assert_eq!(rx.recv().await.unwrap().status, DealStatus::Completed);
    }

    #[tokio::test]
    async fn test_receiver_closed_when_bus_dropped() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe::<ShardReady>();
        drop(bus);
        assert!(rx.recv().await.is_none());
    }
}
