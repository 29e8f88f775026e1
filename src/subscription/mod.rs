//! Subscription index.
//!
//! Two maps are kept in lock-step under a single [`RwLock`]: event source to
//! subscribers, and subscriber to event sources. Every (source, subscriber)
//! pair appears in both maps or in neither. Reads take the shared lock and
//! return owned snapshots, so callers can iterate without holding it.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::model::EventName;

/// Errors from building subscriptions.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("subscriber id must not be empty")]
    EmptySubscriberId,

    #[error("device id must not be empty")]
    EmptyDeviceId,
}

// ============================================================================
// Keys
// ============================================================================

/// Where events come from: one device, or every device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventSource {
    All,
    Device(String),
}

impl EventSource {
    pub fn device(id: impl Into<String>) -> Self {
        EventSource::Device(id.into())
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, EventSource::All)
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSource::All => f.write_str("*"),
            EventSource::Device(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriberId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SubscriberId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ============================================================================
// Filter
// ============================================================================

/// Event-name plus item-name filter.
///
/// An empty `names` set matches every item of the given event kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub event_name: EventName,
    pub names: BTreeSet<String>,
}

impl Filter {
    pub fn new(event_name: EventName) -> Self {
        Self {
            event_name,
            names: BTreeSet::new(),
        }
    }

    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn matches(&self, event_name: EventName, item_name: &str) -> bool {
        self.event_name == event_name && (self.names.is_empty() || self.names.contains(item_name))
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// One (event source, subscriber) pair with its filter and delivery payload.
#[derive(Debug)]
pub struct Subscription<H> {
    event_source: EventSource,
    subscriber_id: SubscriberId,
    filter: Option<Filter>,
    handler: H,
}

impl<H> Subscription<H> {
    pub fn new(
        event_source: EventSource,
        subscriber_id: SubscriberId,
        filter: Option<Filter>,
        handler: H,
    ) -> Result<Self, IndexError> {
        if subscriber_id.as_str().is_empty() {
            return Err(IndexError::EmptySubscriberId);
        }
        if matches!(&event_source, EventSource::Device(id) if id.is_empty()) {
            return Err(IndexError::EmptyDeviceId);
        }
        Ok(Self {
            event_source,
            subscriber_id,
            filter,
            handler,
        })
    }

    pub fn event_source(&self) -> &EventSource {
        &self.event_source
    }

    pub fn subscriber_id(&self) -> &SubscriberId {
        &self.subscriber_id
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// A subscription without a filter accepts everything.
    pub fn accepts(&self, event_name: EventName, item_name: &str) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |f| f.matches(event_name, item_name))
    }
}

// ============================================================================
// Index
// ============================================================================

struct Inner<H> {
    by_source: HashMap<EventSource, HashMap<SubscriberId, Arc<Subscription<H>>>>,
    by_subscriber: HashMap<SubscriberId, HashMap<EventSource, Arc<Subscription<H>>>>,
}

impl<H> Inner<H> {
    fn unlink(&mut self, source: &EventSource, subscriber: &SubscriberId) -> Option<Arc<Subscription<H>>> {
        let removed = match self.by_source.get_mut(source) {
            Some(subscribers) => {
                let removed = subscribers.remove(subscriber);
                if subscribers.is_empty() {
                    self.by_source.remove(source);
                }
                removed
            }
            None => None,
        };
        if let Some(sources) = self.by_subscriber.get_mut(subscriber) {
            sources.remove(source);
            if sources.is_empty() {
                self.by_subscriber.remove(subscriber);
            }
        }
        removed
    }
}

/// Bidirectional (event source, subscriber) index.
pub struct SubscriptionIndex<H> {
    inner: RwLock<Inner<H>>,
}

impl<H> Default for SubscriptionIndex<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> SubscriptionIndex<H> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_source: HashMap::new(),
                by_subscriber: HashMap::new(),
            }),
        }
    }

    /// Inserts a subscription, replacing any existing entry for the same pair.
    ///
    /// Returns the replaced entry.
    pub fn insert(&self, subscription: Subscription<H>) -> Option<Arc<Subscription<H>>> {
        let subscription = Arc::new(subscription);
        let source = subscription.event_source.clone();
        let subscriber = subscription.subscriber_id.clone();

        let mut inner = self.inner.write();
        inner
            .by_subscriber
            .entry(subscriber.clone())
            .or_default()
            .insert(source.clone(), Arc::clone(&subscription));
        inner
            .by_source
            .entry(source)
            .or_default()
            .insert(subscriber, subscription)
    }

    pub fn get(&self, source: &EventSource, subscriber: &SubscriberId) -> Option<Arc<Subscription<H>>> {
        self.inner
            .read()
            .by_source
            .get(source)
            .and_then(|subscribers| subscribers.get(subscriber).cloned())
    }

    /// Subscriptions registered on exactly this source.
    pub fn get_by_source(&self, source: &EventSource) -> Vec<Arc<Subscription<H>>> {
        self.inner
            .read()
            .by_source
            .get(source)
            .map(|subscribers| subscribers.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_by_subscriber(&self, subscriber: &SubscriberId) -> Vec<Arc<Subscription<H>>> {
        self.inner
            .read()
            .by_subscriber
            .get(subscriber)
            .map(|sources| sources.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Subscriptions interested in events from `source`: the device's own
    /// subscriptions first, then the wildcard ones.
    ///
    /// A subscriber holding both appears twice. Callers filter each entry
    /// and collapse the survivors.
    pub fn candidates(&self, source: &EventSource) -> Vec<Arc<Subscription<H>>> {
        let inner = self.inner.read();
        let mut candidates: Vec<Arc<Subscription<H>>> = inner
            .by_source
            .get(source)
            .map(|specific| specific.values().cloned().collect())
            .unwrap_or_default();

        if !source.is_wildcard() {
            if let Some(wildcard) = inner.by_source.get(&EventSource::All) {
                candidates.extend(wildcard.values().cloned());
            }
        }

        candidates
    }

    pub fn remove(&self, source: &EventSource, subscriber: &SubscriberId) -> Option<Arc<Subscription<H>>> {
        self.inner.write().unlink(source, subscriber)
    }

    /// Removes every subscription of `subscriber`. Returns how many were removed.
    pub fn remove_by_subscriber(&self, subscriber: &SubscriberId) -> usize {
        let mut inner = self.inner.write();
        let Some(sources) = inner.by_subscriber.remove(subscriber) else {
            return 0;
        };
        for source in sources.keys() {
            if let Some(subscribers) = inner.by_source.get_mut(source) {
                subscribers.remove(subscriber);
                if subscribers.is_empty() {
                    inner.by_source.remove(source);
                }
            }
        }
        sources.len()
    }

    /// Removes every subscription on exactly `source`.
    pub fn remove_by_event_source(&self, source: &EventSource) -> usize {
        let mut inner = self.inner.write();
        let Some(subscribers) = inner.by_source.remove(source) else {
            return 0;
        };
        for subscriber in subscribers.keys() {
            if let Some(sources) = inner.by_subscriber.get_mut(subscriber) {
                sources.remove(source);
                if sources.is_empty() {
                    inner.by_subscriber.remove(subscriber);
                }
            }
        }
        subscribers.len()
    }

    /// Removes each listed pair. Missing pairs are skipped.
    pub fn remove_pairs<I>(&self, pairs: I) -> usize
    where
        I: IntoIterator<Item = (EventSource, SubscriberId)>,
    {
        let mut inner = self.inner.write();
        pairs
            .into_iter()
            .filter(|(source, subscriber)| inner.unlink(source, subscriber).is_some())
            .count()
    }

    /// Number of (source, subscriber) pairs.
    pub fn len(&self) -> usize {
        self.inner.read().by_source.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_source.is_empty()
    }

    /// Every live pair, in no particular order.
    pub fn pairs(&self) -> Vec<(EventSource, SubscriberId)> {
        let inner = self.inner.read();
        inner
            .by_source
            .iter()
            .flat_map(|(source, subscribers)| {
                subscribers.keys().map(move |id| (source.clone(), id.clone()))
            })
            .collect()
    }

    /// Checks that both maps describe the same set of pairs.
    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        let inner = self.inner.read();
        let forward: usize = inner.by_source.values().map(HashMap::len).sum();
        let backward: usize = inner.by_subscriber.values().map(HashMap::len).sum();
        forward == backward
            && inner.by_source.iter().all(|(source, subscribers)| {
                !subscribers.is_empty()
                    && subscribers.keys().all(|id| {
                        inner
                            .by_subscriber
                            .get(id)
                            .is_some_and(|sources| sources.contains_key(source))
                    })
            })
            && inner.by_subscriber.values().all(|sources| !sources.is_empty())
    }
}
