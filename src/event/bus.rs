// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Topic-keyed event bus for fanning out domain events.
//!
//! Handlers subscribe per [`EventKind`] and are invoked synchronously in
//! registration order. A panicking handler is isolated so the remaining
//! handlers for the topic still run. The bus lives exactly as long as the
//! owning service and is handed to consumers by reference.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use super::{AtsEvent, EventKind};

/// Unique identifier for a bus subscription, usable to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sub({})", self.0)
    }
}

type Handler = Arc<dyn Fn(&AtsEvent) + Send + Sync>;

/// Multi-listener registry for [`AtsEvent`]s.
///
/// # Examples
///
/// ```
/// use atslink::event::{AtsEvent, EventBus, EventKind};
///
/// let bus = EventBus::new();
/// bus.subscribe(EventKind::SirenActived, |_event| {
///     println!("siren!");
/// });
/// bus.publish(&AtsEvent::SirenActived);
/// ```
pub struct EventBus {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>,
}

impl EventBus {
    /// Creates a new empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a handler for one event kind.
    ///
    /// Multiple handlers per kind are allowed; delivery order is
    /// registration order.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&AtsEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes a handler by its subscription id.
    ///
    /// Returns `true` if a handler was found and removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        for list in handlers.values_mut() {
            if let Some(pos) = list.iter().position(|(entry_id, _)| *entry_id == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Delivers an event to every handler registered for its kind.
    ///
    /// Handlers run synchronously on the calling thread, in registration
    /// order. A panic inside one handler does not suppress the others.
    pub fn publish(&self, event: &AtsEvent) {
        let snapshot: Vec<Handler> = {
            let handlers = self.handlers.read();
            match handlers.get(&event.kind()) {
                Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return,
            }
        };

        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::warn!(kind = ?event.kind(), "event handler panicked");
            }
        }
    }

    /// Returns the number of handlers registered for a kind.
    #[must_use]
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total: usize = self.handlers.read().values().map(Vec::len).sum();
        f.debug_struct("EventBus")
            .field("handler_count", &total)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(&AtsEvent::SirenActived);
        assert_eq!(bus.handler_count(EventKind::SirenActived), 0);
    }

    #[test]
    fn publish_invokes_subscriber() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        bus.subscribe(EventKind::SirenActived, move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&AtsEvent::SirenActived);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn publish_ignores_other_topics() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        bus.subscribe(EventKind::SirenActived, move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&AtsEvent::SirenSilenced);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn delivery_preserves_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3u32 {
            let order_clone = order.clone();
            bus.subscribe(EventKind::MaxAlerts, move |_| {
                order_clone.lock().push(tag);
            });
        }

        bus.publish(&AtsEvent::MaxAlerts);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn panicking_handler_does_not_suppress_later_handlers() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        bus.subscribe(EventKind::SirenActived, |_| {
            panic!("handler failure");
        });
        bus.subscribe(EventKind::SirenActived, move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&AtsEvent::SirenActived);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_removes_handler() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let id = bus.subscribe(EventKind::SirenActived, move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        bus.publish(&AtsEvent::SirenActived);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscription_ids_are_unique() {
        let bus = EventBus::new();
        let a = bus.subscribe(EventKind::MaxAlerts, |_| {});
        let b = bus.subscribe(EventKind::SirenActived, |_| {});
        assert_ne!(a, b);
    }
}
