//! Synchronous subscriber registry.
//!
//! Subscribers are registered against an exact topic and optionally tagged with
//! an owner (an extension id). The returned [`SubscriberId`] is the handle used
//! to detach a single subscription; [`SubscriberRegistry::unregister_owner`]
//! detaches everything an owner registered in one step.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::trace;

use crate::bus::EventBus;
use crate::event::Event;

/// Handle identifying one registered subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Raw numeric value, as handed to sandboxed code.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Rebuild a handle from its raw value.
    #[must_use]
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A synchronous event handler.
///
/// `on_event` runs on the publishing thread. Implementations must not block;
/// long work belongs on a channel owned by the subscriber.
pub trait EventSubscriber: Send + Sync {
    /// Called once for every event published on the subscribed topic.
    fn on_event(&self, event: &Event, bus: &EventBus);
}

/// Closure-backed subscriber.
pub struct FilterSubscriber<F> {
    name: String,
    handler: F,
}

impl<F> FilterSubscriber<F>
where
    F: Fn(&Event) + Send + Sync,
{
    /// Wrap a closure as a subscriber.
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<F> EventSubscriber for FilterSubscriber<F>
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event, _bus: &EventBus) {
        (self.handler)(event);
    }
}

impl<F> fmt::Debug for FilterSubscriber<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterSubscriber")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

struct Registration {
    topic: String,
    owner: Option<String>,
    subscriber: Arc<dyn EventSubscriber>,
}

/// Table of synchronous subscribers keyed by [`SubscriberId`].
pub struct SubscriberRegistry {
    entries: DashMap<SubscriberId, Registration>,
    next_id: AtomicU64,
}

impl SubscriberRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register `subscriber` for events whose topic equals `topic`.
    pub fn register(
        &self,
        topic: impl Into<String>,
        owner: Option<&str>,
        subscriber: Arc<dyn EventSubscriber>,
    ) -> SubscriberId {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let topic = topic.into();
        trace!(%id, %topic, owner = ?owner, "Registering subscriber");
        self.entries.insert(
            id,
            Registration {
                topic,
                owner: owner.map(str::to_owned),
                subscriber,
            },
        );
        id
    }

    /// Remove a single subscription. Returns `false` if it was already gone.
    pub fn unregister(&self, id: SubscriberId) -> bool {
        // Bind the removed value so it drops after the shard lock is released.
        let removed = self.entries.remove(&id);
        removed.is_some()
    }

    /// Remove a subscription only if it belongs to `owner`.
    pub fn unregister_owned(&self, id: SubscriberId, owner: &str) -> bool {
        let removed = self
            .entries
            .remove_if(&id, |_, reg| reg.owner.as_deref() == Some(owner));
        removed.is_some()
    }

    /// Remove every subscription registered by `owner`. Returns how many were removed.
    pub fn unregister_owner(&self, owner: &str) -> usize {
        let ids: Vec<SubscriberId> = self
            .entries
            .iter()
            .filter(|entry| entry.owner.as_deref() == Some(owner))
            .map(|entry| *entry.key())
            .collect();

        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.entries.remove(&id) {
                removed.push(entry);
            }
        }
        removed.len()
    }

    /// Number of subscriptions owned by `owner`.
    #[must_use]
    pub fn owned_by(&self, owner: &str) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.owner.as_deref() == Some(owner))
            .count()
    }

    /// Total number of subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no subscriptions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deliver `event` to every subscriber of its exact topic.
    ///
    /// Matching subscribers are snapshotted before any callback runs, so a
    /// subscriber may register or unregister from inside `on_event`.
    /// Returns the number of subscribers notified.
    pub(crate) fn notify(&self, event: &Event, bus: &EventBus) -> usize {
        let mut matching: Vec<(SubscriberId, Arc<dyn EventSubscriber>)> = self
            .entries
            .iter()
            .filter(|entry| entry.topic == event.topic)
            .map(|entry| (*entry.key(), Arc::clone(&entry.subscriber)))
            .collect();
        matching.sort_by_key(|(id, _)| *id);

        for (_, subscriber) in &matching {
            subscriber.on_event(event, bus);
        }
        matching.len()
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("subscriptions", &self.entries.len())
            .finish()
    }
}
