use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

/// An event delivered to a channel's subscribers.
#[derive(Debug, Clone)]
pub struct Event {
    pub channel: String,
    pub payload: Value,
}

type Handler = Box<dyn Fn(&Event) + Send + Sync>;

struct Subscriber {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct Inner {
    channels: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

/// Synchronous, in-memory, multi-channel pub/sub.
///
/// Subscribers are invoked in insertion order within the emitter's own
/// execution context -- `emit` never suspends and applies no back-pressure.
/// Only ephemeral signals belong here; durable state lives in `HistoryStore`.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Inner>,
}

/// Idempotent unsubscribe handle returned by [`EventBus::subscribe`].
pub struct Unsubscribe {
    inner: Arc<Inner>,
    channel: String,
    id: u64,
    done: AtomicBool,
}

impl Unsubscribe {
    /// Removes this subscriber. Safe to call more than once.
    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut channels = self.inner.channels.lock();
        if let Some(subs) = channels.get_mut(&self.channel) {
            subs.retain(|s| s.id != self.id);
            if subs.is_empty() {
                channels.remove(&self.channel);
            }
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` on `channel`. Returns a handle whose `unsubscribe`
    /// is idempotent.
    pub fn subscribe<F>(&self, channel: impl Into<String>, handler: F) -> Unsubscribe
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let channel = channel.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .channels
            .lock()
            .entry(channel.clone())
            .or_default()
            .push(Subscriber {
                id,
                handler: Box::new(handler),
            });

        Unsubscribe {
            inner: self.inner.clone(),
            channel,
            id,
            done: AtomicBool::new(false),
        }
    }

    /// Invokes every subscriber on `channel` with `payload`, in insertion
    /// order. O(n) in the number of subscribers; never suspends.
    pub fn emit(&self, channel: impl Into<String>, payload: Value) {
        let channel = channel.into();
        let event = Event {
            channel: channel.clone(),
            payload,
        };
        let channels = self.inner.channels.lock();
        if let Some(subs) = channels.get(&channel) {
            trace!(channel = %channel, subscribers = subs.len(), "emit");
            for sub in subs {
                (sub.handler)(&event);
            }
        }
    }

    /// Number of live subscribers on `channel` (0 if the channel has none).
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .lock()
            .get(channel)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emits_in_insertion_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let _s1 = bus.subscribe("x", move |_| o1.lock().push(1));
        let _s2 = bus.subscribe("x", move |_| o2.lock().push(2));
        bus.emit("x", Value::Null);
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_removes_empty_channel() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = bus.subscribe("x", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.subscriber_count("x"), 1);
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count("x"), 0);
        bus.emit("x", Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn emit_on_unknown_channel_is_noop() {
        let bus = EventBus::new();
        bus.emit("nobody-home", Value::Null);
    }
}
