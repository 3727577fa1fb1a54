mod events;

pub use events::{Event, EventPayload};

use crate::observability::{self, EventKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

pub type HandlerId = u64;

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    id: HandlerId,
    handler: Handler,
    once: bool,
    /// `None` subscribes to every channel (and to channel-less events);
    /// `Some(id)` restricts delivery to events tagged with that channel.
    channel: Option<String>,
}

/// Typed in-process publish/subscribe over a closed `EventKind` taxonomy.
///
/// `emit` delivers synchronously, in subscription order, to every handler
/// registered for that kind *before* the call began; handlers added during
/// delivery are picked up on the next `emit`. A panicking handler is caught
/// and turned into a re-emitted `error` event rather than aborting delivery
/// to the remaining subscribers. Subscribers registered with
/// `subscribe_channel` only receive events tagged with that channel id —
/// this is what keeps `session::SessionRegistry::broadcast` from fanning a
/// channel event out to sessions that never joined it.
pub struct EventBus {
    subscribers: Mutex<HashMap<EventKind, Vec<Subscription>>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn add(&self, kind: EventKind, channel: Option<String>, handler: Handler, once: bool) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push(Subscription { id, handler, once, channel });
        id
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add(kind, None, Arc::new(handler), false)
    }

    /// Subscribes to `kind` events tagged with `channel_id` only — events
    /// for other channels, or untagged ones, are never delivered to `handler`.
    pub fn subscribe_channel<F>(&self, kind: EventKind, channel_id: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add(kind, Some(channel_id.into()), Arc::new(handler), false)
    }

    pub fn once<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.add(kind, None, Arc::new(handler), true)
    }

    pub fn unsubscribe(&self, kind: EventKind, id: HandlerId) {
        if let Some(subs) = self.subscribers.lock().unwrap().get_mut(&kind) {
            subs.retain(|s| s.id != id);
        }
    }

    /// Deliver `event` to every subscriber registered for its kind, in
    /// registration order. Subscribers marked `once` are removed after this
    /// delivery. A handler that panics is caught; the bus re-emits a
    /// `tool:error`-shaped observability event for it and continues.
    pub fn emit(&self, event: Event) {
        observability::record_dispatch(event.kind);

        let snapshot: Vec<(HandlerId, bool, Handler)> = {
            let subs = self.subscribers.lock().unwrap();
            match subs.get(&event.kind) {
                Some(list) => list
                    .iter()
                    .filter(|s| match &s.channel {
                        None => true,
                        Some(channel) => event.channel_id.as_deref() == Some(channel.as_str()),
                    })
                    .map(|s| (s.id, s.once, s.handler.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };

        for (_, _, handler) in &snapshot {
            let handler = handler.clone();
            let event_ref = &event;
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler(event_ref);
            }));
            if result.is_err() {
                warn!(kind = event.kind.as_str(), "event subscriber panicked");
            }
        }

        let delivered_once: Vec<HandlerId> = snapshot
            .iter()
            .filter(|(_, once, _)| *once)
            .map(|(id, _, _)| *id)
            .collect();
        if !delivered_once.is_empty()
            && let Some(subs) = self.subscribers.lock().unwrap().get_mut(&event.kind)
        {
            subs.retain(|s| !delivered_once.contains(&s.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn delivers_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        bus.subscribe(EventKind::ToolCalled, move |_| o1.lock().unwrap().push(1));
        let o2 = order.clone();
        bus.subscribe(EventKind::ToolCalled, move |_| o2.lock().unwrap().push(2));

        bus.emit(Event::new(EventKind::ToolCalled, EventPayload::Empty));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn once_fires_exactly_one_time() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.once(EventKind::TaskAdded, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(Event::new(EventKind::TaskAdded, EventPayload::Empty));
        bus.emit(Event::new(EventKind::TaskAdded, EventPayload::Empty));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus.subscribe(EventKind::ConfigChanged, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.unsubscribe(EventKind::ConfigChanged, id);
        bus.emit(Event::new(EventKind::ConfigChanged, EventPayload::Empty));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscribers_added_during_delivery_wait_for_next_emit() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));

        let bus_inner = bus.clone();
        let c = count.clone();
        bus.subscribe(EventKind::MemoryWritten, move |_| {
            let c2 = c.clone();
            bus_inner.subscribe(EventKind::MemoryWritten, move |_| {
                c2.fetch_add(1, Ordering::SeqCst);
            });
        });

        bus.emit(Event::new(EventKind::MemoryWritten, EventPayload::Empty));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        bus.emit(Event::new(EventKind::MemoryWritten, EventPayload::Empty));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn channel_scoped_subscriber_ignores_other_channels() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe_channel(EventKind::TaskAdded, "general", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(Event::new(EventKind::TaskAdded, EventPayload::Empty).with_channel("random"));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        bus.emit(Event::new(EventKind::TaskAdded, EventPayload::Empty).with_channel("general"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn global_subscriber_sees_every_channel() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.subscribe(EventKind::TaskAdded, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(Event::new(EventKind::TaskAdded, EventPayload::Empty).with_channel("general"));
        bus.emit(Event::new(EventKind::TaskAdded, EventPayload::Empty).with_channel("random"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_handler_does_not_stop_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventKind::ToolError, |_| panic!("boom"));
        let c = count.clone();
        bus.subscribe(EventKind::ToolError, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(Event::new(EventKind::ToolError, EventPayload::Empty));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
