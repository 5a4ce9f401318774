//! Typed publish/subscribe dispatch keyed by message kind.
//!
//! Handlers run synchronously in subscription order; a slow handler delays
//! subsequent message processing, which is the documented tradeoff of the
//! cooperative dispatch model. Wildcard ([`MessageKind::Any`]) handlers are
//! delivered separately after the exact-kind handlers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use camline_protocol::{Message, MessageKind};

type Handler = Arc<dyn Fn(&Message) + Send + Sync + 'static>;

/// Token returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct BusInner {
    next_id: u64,
    handlers: HashMap<MessageKind, Vec<(u64, Handler)>>,
}

/// Event bus with per-kind handler lists.
///
/// Internally locked; handlers are snapshotted before invocation so a
/// handler may subscribe or unsubscribe without deadlocking.
#[derive(Default)]
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes a handler to a message kind. Multiple handlers per kind
    /// run in subscription order.
    pub fn on(
        &self,
        kind: MessageKind,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        inner.next_id += 1;
        let id = inner.next_id;
        inner
            .handlers
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        SubscriptionId(id)
    }

    /// Unsubscribes a handler. Returns true if the subscription existed.
    pub fn off(&self, kind: MessageKind, id: SubscriptionId) -> bool {
        let mut inner = self.inner.lock().expect("event bus lock poisoned");
        let Some(handlers) = inner.handlers.get_mut(&kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id.0);
        handlers.len() != before
    }

    /// Delivers a message to handlers registered for its exact kind, then to
    /// wildcard handlers.
    pub fn emit(&self, kind: MessageKind, message: &Message) {
        for handler in self.snapshot(kind) {
            handler(message);
        }
        if kind != MessageKind::Any {
            for handler in self.snapshot(MessageKind::Any) {
                handler(message);
            }
        }
    }

    fn snapshot(&self, kind: MessageKind) -> Vec<Handler> {
        let inner = self.inner.lock().expect("event bus lock poisoned");
        inner
            .handlers
            .get(&kind)
            .map(|handlers| handlers.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn message(kind: MessageKind) -> Message {
        Message::synthetic(kind)
    }

    #[test]
    fn handlers_run_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = order.clone();
            bus.on(MessageKind::Cmesg, move |_| {
                order.lock().unwrap().push(label);
            });
        }

        bus.emit(MessageKind::Cmesg, &message(MessageKind::Cmesg));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn wildcard_receives_every_kind() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        bus.on(MessageKind::Any, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(MessageKind::Cmesg, &message(MessageKind::Cmesg));
        bus.emit(MessageKind::Details, &message(MessageKind::Details));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn wildcard_not_delivered_twice_for_any() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        bus.on(MessageKind::Any, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(MessageKind::Any, &message(MessageKind::Any));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_removes_only_that_handler() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let seen = count.clone();
        let first = bus.on(MessageKind::Pmesg, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let seen = count.clone();
        let _second = bus.on(MessageKind::Pmesg, move |_| {
            seen.fetch_add(10, Ordering::SeqCst);
        });

        assert!(bus.off(MessageKind::Pmesg, first));
        assert!(!bus.off(MessageKind::Pmesg, first));

        bus.emit(MessageKind::Pmesg, &message(MessageKind::Pmesg));
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn handler_may_subscribe_during_emit() {
        let bus = Arc::new(EventBus::new());
        let nested = bus.clone();
        bus.on(MessageKind::Cmesg, move |_| {
            nested.on(MessageKind::Pmesg, |_| {});
        });
        // Must not deadlock.
        bus.emit(MessageKind::Cmesg, &message(MessageKind::Cmesg));
    }
}
