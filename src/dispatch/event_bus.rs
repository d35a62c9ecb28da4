//! Event registry keyed by [`EventKind`]
//!
//! Subscribers receive events through their own unbounded channel, so a
//! slow subscriber never blocks the connection's I/O task. A subscription
//! is removed from the registry when it is dropped.

use crate::protocol::events::{EventKind, ServerEvent};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<EventKind, Vec<(u64, mpsc::UnboundedSender<ServerEvent>)>>,
}

impl Registry {
    fn remove(&mut self, id: u64, kinds: &[EventKind]) {
        for kind in kinds {
            if let Some(list) = self.subscribers.get_mut(kind) {
                list.retain(|(sub_id, _)| *sub_id != id);
                if list.is_empty() {
                    self.subscribers.remove(kind);
                }
            }
        }
    }
}

/// Shared event registry; clones refer to the same subscribers
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
    /// Stamped on published events when non-zero
    connection: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A publishing handle on the same registry that tags events with
    /// `connection`
    pub fn for_connection(&self, connection: u64) -> EventBus {
        EventBus {
            registry: Arc::clone(&self.registry),
            connection,
        }
    }

    pub fn subscribe(&self, kind: EventKind) -> Subscription {
        self.subscribe_all([kind])
    }

    /// One subscription receiving every listed kind, in publish order
    pub fn subscribe_all(&self, kinds: impl IntoIterator<Item = EventKind>) -> Subscription {
        let kinds: Vec<EventKind> = kinds.into_iter().collect();
        let (tx, rx) = mpsc::unbounded_channel();

        // Intentional .unwrap() - poisoned mutex indicates serious bug
        let mut registry = self.registry.lock().unwrap();
        let id = registry.next_id;
        registry.next_id += 1;
        for kind in &kinds {
            registry
                .subscribers
                .entry(kind.clone())
                .or_default()
                .push((id, tx.clone()));
        }
        drop(registry);

        trace!("EventBus: subscription {} for {:?}", id, kinds);

        Subscription {
            id,
            kinds,
            receiver: rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver an event to every subscriber of its kind
    ///
    /// Returns the number of subscribers reached.
    pub fn publish(&self, mut event: ServerEvent) -> usize {
        if self.connection != 0 {
            event.connection = self.connection;
        }
        let mut registry = self.registry.lock().unwrap();
        let Some(list) = registry.subscribers.get_mut(&event.kind) else {
            trace!("EventBus: no subscribers for {}", event.kind);
            return 0;
        };

        list.retain(|(_, tx)| !tx.is_closed());
        for (_, tx) in list.iter() {
            let _ = tx.send(event.clone());
        }
        list.len()
    }

    pub fn subscriber_count(&self, kind: &EventKind) -> usize {
        self.registry
            .lock()
            .unwrap()
            .subscribers
            .get(kind)
            .map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock().unwrap();
        f.debug_struct("EventBus")
            .field("kinds", &registry.subscribers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Receiving end of an [`EventBus`] subscription
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    kinds: Vec<EventKind>,
    receiver: mpsc::UnboundedReceiver<ServerEvent>,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Next event; `None` once the bus is gone and the backlog is drained
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn kinds(&self) -> &[EventKind] {
        &self.kinds
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut registry) = registry.lock() {
                registry.remove(self.id, &self.kinds);
            }
        }
    }
}
