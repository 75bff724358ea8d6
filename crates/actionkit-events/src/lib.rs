//! Scoped event bus for action instances.
//!
//! Entries are keyed by `(action type, identity, event)`, so two instances of
//! the same type never hear each other. Delivery is synchronous and follows
//! subscription order. Subscribers are invoked with the bus unlocked, which
//! lets them subscribe, publish or drop instances re-entrantly.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use actionkit_protocol::{ActionType, Identity};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

/// Event published by `record_memory`. It is always accepted, whatever the
/// emitter declares.
pub const RECORD_MEMORY_EVENT: &str = "action.record_memory";

/// Fully qualified bus key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub action: ActionType,
    pub identity: Identity,
    pub event: String,
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.action, self.identity, self.event)
    }
}

/// The `(type, identity)` pair an instance publishes and subscribes under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventSource {
    pub action: ActionType,
    pub identity: Identity,
}

impl EventSource {
    pub fn new(action: ActionType, identity: Identity) -> Self {
        Self { action, identity }
    }

    pub fn key(&self, event: impl Into<String>) -> EventKey {
        EventKey {
            action: self.action.clone(),
            identity: self.identity.clone(),
            event: event.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

pub type Subscriber = Arc<dyn Fn(&Value) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    callback: Subscriber,
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    entries: HashMap<EventKey, Vec<Subscription>>,
    index: HashMap<SubscriptionId, EventKey>,
}

#[derive(Default)]
pub struct EventBus {
    state: Mutex<BusState>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EventBus")
            .field("entries", &state.entries.len())
            .field("subscriptions", &state.index.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, key: EventKey, callback: Subscriber) -> SubscriptionId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        debug!(key = %key, ?id, "subscribe");
        state.index.insert(id, key.clone());
        state
            .entries
            .entry(key)
            .or_default()
            .push(Subscription { id, callback });
        id
    }

    /// Remove one subscription. Returns whether it was still present.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let Some(key) = state.index.remove(&id) else {
                return false;
            };
            let mut removed = None;
            if let Some(subscriptions) = state.entries.get_mut(&key) {
                if let Some(pos) = subscriptions.iter().position(|s| s.id == id) {
                    removed = Some(subscriptions.remove(pos));
                }
                if subscriptions.is_empty() {
                    state.entries.remove(&key);
                }
            }
            removed
        };
        removed.is_some()
    }

    /// Deliver `data` to every subscriber of `key`, in subscription order.
    /// Returns the number of subscribers invoked.
    pub fn publish(&self, key: &EventKey, data: &Value) -> usize {
        let callbacks: Vec<Subscriber> = {
            let state = self.state.lock();
            state
                .entries
                .get(key)
                .map(|subs| subs.iter().map(|s| Arc::clone(&s.callback)).collect())
                .unwrap_or_default()
        };
        debug!(key = %key, subscribers = callbacks.len(), "publish");
        for callback in &callbacks {
            callback(data);
        }
        callbacks.len()
    }

    pub fn has_subscribers(&self, key: &EventKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    pub fn subscriber_count(&self, key: &EventKey) -> usize {
        self.state.lock().entries.get(key).map_or(0, Vec::len)
    }

    /// Drop every entry registered under `identity`. Returns the number of
    /// subscriptions removed.
    pub fn forget(&self, identity: &Identity) -> usize {
        let removed: Vec<Subscription> = {
            let mut state = self.state.lock();
            let keys: Vec<EventKey> = state
                .entries
                .keys()
                .filter(|key| &key.identity == identity)
                .cloned()
                .collect();
            let mut removed = Vec::new();
            for key in keys {
                if let Some(subs) = state.entries.remove(&key) {
                    removed.extend(subs);
                }
            }
            for sub in &removed {
                state.index.remove(&sub.id);
            }
            removed
        };
        if !removed.is_empty() {
            debug!(%identity, removed = removed.len(), "forget identity");
        }
        // Subscriber closures may own instances whose disposal re-enters the
        // bus, so they are dropped here, outside the lock.
        let count = removed.len();
        drop(removed);
        count
    }
}

/// One relay hop: `source` forwarded `event` to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropagationKey {
    pub source: Identity,
    pub target: Identity,
    pub event: String,
}

/// Relay keys used within the current emission cascade.
///
/// A cascade starts with an outermost `enter` and ends with the matching
/// `exit`, at which point the used keys are cleared.
#[derive(Debug, Default)]
pub struct PropagationLedger {
    depth: usize,
    used: HashSet<PropagationKey>,
}

impl PropagationLedger {
    pub fn enter(&mut self) {
        self.depth += 1;
    }

    pub fn exit(&mut self) {
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 {
            self.used.clear();
        }
    }

    /// Record `key`; false when it was already used in this cascade.
    pub fn try_mark(&mut self, key: PropagationKey) -> bool {
        self.used.insert(key)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(name: &str) -> EventSource {
        EventSource::new(ActionType::new(name), Identity::new())
    }

    fn recorder() -> (Arc<Mutex<Vec<Value>>>, Subscriber) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: Subscriber = Arc::new(move |data: &Value| sink.lock().push(data.clone()));
        (seen, callback)
    }

    #[test]
    fn publish_reaches_only_matching_identity() {
        let bus = EventBus::new();
        let a = source("Root");
        let b = EventSource::new(a.action.clone(), Identity::new());
        let (seen, callback) = recorder();
        bus.subscribe(a.key("done"), callback);

        assert_eq!(bus.publish(&b.key("done"), &Value::from(1)), 0);
        assert_eq!(bus.publish(&a.key("done"), &Value::from(2)), 1);
        assert_eq!(*seen.lock(), vec![Value::from(2)]);
    }

    #[test]
    fn delivery_follows_subscription_order() {
        let bus = EventBus::new();
        let a = source("Root");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            bus.subscribe(a.key("tick"), Arc::new(move |_| order.lock().push(i)));
        }
        bus.publish(&a.key("tick"), &Value::Null);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn unsubscribe_removes_single_entry() {
        let bus = EventBus::new();
        let a = source("Root");
        let (_, first) = recorder();
        let (_, second) = recorder();
        let id = bus.subscribe(a.key("x"), first);
        bus.subscribe(a.key("x"), second);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(&a.key("x")), 1);
    }

    #[test]
    fn forget_clears_every_event_of_identity() {
        let bus = EventBus::new();
        let a = source("Root");
        let other = source("Root");
        let (_, cb) = recorder();
        bus.subscribe(a.key("x"), Arc::clone(&cb));
        bus.subscribe(a.key("y"), Arc::clone(&cb));
        bus.subscribe(other.key("x"), cb);

        assert_eq!(bus.forget(&a.identity), 2);
        assert!(!bus.has_subscribers(&a.key("x")));
        assert!(!bus.has_subscribers(&a.key("y")));
        assert!(bus.has_subscribers(&other.key("x")));
    }

    #[test]
    fn subscriber_may_publish_reentrantly() {
        let bus = Arc::new(EventBus::new());
        let a = source("Root");
        let (seen, inner) = recorder();
        bus.subscribe(a.key("inner"), inner);

        let relay_bus = Arc::clone(&bus);
        let relay_key = a.key("inner");
        bus.subscribe(
            a.key("outer"),
            Arc::new(move |data| {
                relay_bus.publish(&relay_key, data);
            }),
        );

        bus.publish(&a.key("outer"), &Value::from("hello"));
        assert_eq!(*seen.lock(), vec![Value::from("hello")]);
    }

    #[test]
    fn event_key_renders_dotted() {
        let a = EventSource::new(ActionType::new("Root"), Identity::from_string("abc"));
        assert_eq!(a.key("done").to_string(), "Root.abc.done");
    }

    #[test]
    fn ledger_clears_when_cascade_ends() {
        let mut ledger = PropagationLedger::default();
        let key = PropagationKey {
            source: Identity::new(),
            target: Identity::new(),
            event: "e".into(),
        };

        ledger.enter();
        assert!(ledger.try_mark(key.clone()));
        ledger.enter();
        assert!(!ledger.try_mark(key.clone()));
        ledger.exit();
        assert!(!ledger.try_mark(key.clone()));
        ledger.exit();
        assert_eq!(ledger.depth(), 0);

        ledger.enter();
        assert!(ledger.try_mark(key));
        ledger.exit();
    }
}
