//! Keyed subscription multiplexer
//!
//! This crate provides the EventBus, which maps each observed key (a remote
//! entity or a store variable) to an ordered list of independently
//! identified handlers. Removing one subscription never disturbs the other
//! subscriptions on the same key.
//!
//! The registry lock is held only while the subscriber list is mutated or
//! copied. Handlers run against a snapshot with no lock held, so they may
//! freely subscribe, unsubscribe or write back into the store; registry
//! changes made during a dispatch take effect on the next dispatch.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use ha_core::SubscriptionId;
use tracing::{trace, warn};

/// A subscriber callback
pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Subscriber<E> {
    id: SubscriptionId,
    handler: Handler<E>,
}

impl<E> Clone for Subscriber<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            handler: self.handler.clone(),
        }
    }
}

/// Outcome of a single dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dispatched {
    /// Handlers that returned normally
    pub delivered: usize,
    /// Handlers that panicked (logged and skipped)
    pub panicked: usize,
}

/// The subscription multiplexer
///
/// The EventBus supports:
/// - Subscribing any number of handlers to the same key
/// - Removing exactly one subscription by its id
/// - Dispatching an event to every handler of a key in registration order
/// - Isolating handler panics so one bad subscriber cannot halt the rest
pub struct EventBus<E> {
    /// Subscribers per key, in registration order
    subscribers: DashMap<String, Vec<Subscriber<E>>>,
    /// Reverse index so a subscription can be removed by id alone
    index: DashMap<SubscriptionId, String>,
    /// Counter for generating unique subscription IDs
    next_id: AtomicU64,
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            index: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append a handler to the key's subscriber list
    ///
    /// Never deduplicates: subscribing the same closure twice yields two
    /// subscriptions that are each invoked and each removable.
    pub fn subscribe(&self, key: impl Into<String>, handler: Handler<E>) -> SubscriptionId {
        let key = key.into();
        let id = SubscriptionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        trace!(key = %key, subscription_id = %id, "Subscribing");

        self.subscribers
            .entry(key.clone())
            .or_default()
            .push(Subscriber { id, handler });
        self.index.insert(id, key);
        id
    }

    /// Remove exactly the subscription with this id
    ///
    /// Returns false if the id is unknown or was already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Some((_, key)) = self.index.remove(&id) else {
            return false;
        };

        let removed = match self.subscribers.get_mut(&key) {
            Some(mut list) => {
                let before = list.len();
                list.retain(|s| s.id != id);
                before != list.len()
            }
            None => false,
        };
        self.subscribers.remove_if(&key, |_, list| list.is_empty());

        trace!(key = %key, subscription_id = %id, removed, "Unsubscribed");
        removed
    }

    /// Invoke every handler registered for `key`, in registration order
    pub fn dispatch(&self, key: &str, event: &E) -> Dispatched {
        // Copy under the shard lock, release before invoking anything
        let snapshot: Vec<Subscriber<E>> = self
            .subscribers
            .get(key)
            .map(|list| list.clone())
            .unwrap_or_default();

        let mut outcome = Dispatched::default();
        for subscriber in snapshot {
            match catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(event))) {
                Ok(()) => outcome.delivered += 1,
                Err(payload) => {
                    outcome.panicked += 1;
                    warn!(
                        key = %key,
                        subscription_id = %subscriber.id,
                        panic = %panic_message(payload.as_ref()),
                        "Subscriber handler panicked"
                    );
                }
            }
        }
        outcome
    }

    /// Number of live subscriptions on a key
    pub fn subscriber_count(&self, key: &str) -> usize {
        self.subscribers.get(key).map(|l| l.len()).unwrap_or(0)
    }

    /// Whether a subscription is still registered
    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.index.contains_key(&id)
    }

    /// Keys with at least one subscriber
    pub fn keys(&self) -> Vec<String> {
        self.subscribers.iter().map(|r| r.key().clone()).collect()
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Thread-safe wrapper for EventBus
pub type SharedEventBus<E> = Arc<EventBus<E>>;
