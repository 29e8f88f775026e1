//! Event bus: subscription routing and fan-out.
//!
//! This module contains:
//! - `EventBus`: subscribe/unsubscribe and publish with filter + access checks
//! - `DeliveryHandler`: what happens to an event once it matches
//! - `ReplySink`/`SessionSink`: seams to the RPC reply path and live sessions
//! - `AccessCheck`: per-publish authorization for principal-bound subscribers
//!
//! Deliveries never run on the publishing thread; each one is queued to the
//! bus executor. Publishing returns as soon as every delivery is queued.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::model::{DeviceEvent, EventName, Response};
use crate::ring::{Executor, RingError};
use crate::subscription::{EventSource, Filter, IndexError, SubscriberId, Subscription, SubscriptionIndex};

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Invalid subscription: {0}")]
    Subscription(#[from] IndexError),

    #[error("Executor unavailable: {0}")]
    Executor(#[from] RingError),

    #[error("Reply failed: {0}")]
    Reply(String),

    #[error("Session delivery failed: {0}")]
    Delivery(String),

    #[error("No {0} sink configured")]
    MissingSink(&'static str),
}

// ============================================================================
// Seams
// ============================================================================

/// Sends responses to a reply topic.
pub trait ReplySink: Send + Sync {
    fn reply(&self, reply_to: &str, response: Response) -> Result<()>;
}

/// Pushes serialized messages to live client sessions.
pub trait SessionSink: Send + Sync {
    fn deliver(&self, message: String, destination: &str) -> Result<()>;
}

/// Identity a subscription was created under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal(String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Decides whether a principal may see events from a source.
///
/// Evaluated on every publish, so revoked access takes effect without
/// resubscribing.
pub trait AccessCheck: Send + Sync {
    fn has_access(&self, principal: &Principal, source: &EventSource) -> bool;
}

/// Grants everything.
pub struct AllowAll;

impl AccessCheck for AllowAll {
    fn has_access(&self, _principal: &Principal, _source: &EventSource) -> bool {
        true
    }
}

// ============================================================================
// Subscribers
// ============================================================================

pub type EventCallback = Arc<dyn Fn(&DeviceEvent) + Send + Sync>;

/// What to do with a matching event.
#[derive(Clone)]
pub enum DeliveryHandler {
    /// Send a partial response (`last = false`) to an RPC caller's reply topic.
    Reply {
        reply_to: String,
        correlation_id: String,
    },
    /// Push a session message to a live connection.
    Session { destination: String },
    /// Call a closure on an executor thread.
    Callback(EventCallback),
}

impl fmt::Debug for DeliveryHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryHandler::Reply {
                reply_to,
                correlation_id,
            } => f
                .debug_struct("Reply")
                .field("reply_to", reply_to)
                .field("correlation_id", correlation_id)
                .finish(),
            DeliveryHandler::Session { destination } => f
                .debug_struct("Session")
                .field("destination", destination)
                .finish(),
            DeliveryHandler::Callback(_) => f.write_str("Callback"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub handler: DeliveryHandler,
    pub principal: Option<Principal>,
}

impl Subscriber {
    pub fn reply(
        id: impl Into<SubscriberId>,
        reply_to: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            handler: DeliveryHandler::Reply {
                reply_to: reply_to.into(),
                correlation_id: correlation_id.into(),
            },
            principal: None,
        }
    }

    pub fn session(id: impl Into<SubscriberId>, destination: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handler: DeliveryHandler::Session {
                destination: destination.into(),
            },
            principal: None,
        }
    }

    pub fn callback<F>(id: impl Into<SubscriberId>, callback: F) -> Self
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            handler: DeliveryHandler::Callback(Arc::new(callback)),
            principal: None,
        }
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }
}

/// Per-subscription delivery data kept in the index.
#[derive(Debug, Clone)]
pub struct Route {
    pub handler: DeliveryHandler,
    pub principal: Option<Principal>,
}

/// Outcome of one publish.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishResult {
    /// Deliveries queued to the executor.
    pub scheduled: usize,
    /// Candidates rejected by their filter.
    pub filtered: usize,
    /// Candidates whose principal lost access.
    pub denied: usize,
    /// Wildcard matches skipped because the subscriber was already served.
    pub duplicates: usize,
}

// ============================================================================
// Event bus
// ============================================================================

pub struct EventBus {
    index: Arc<SubscriptionIndex<Route>>,
    executor: Arc<Executor>,
    access: Arc<dyn AccessCheck>,
    replies: Option<Arc<dyn ReplySink>>,
    sessions: Option<Arc<dyn SessionSink>>,
}

impl EventBus {
    pub fn builder(executor: Arc<Executor>) -> EventBusBuilder {
        EventBusBuilder {
            executor,
            index: None,
            access: None,
            replies: None,
            sessions: None,
        }
    }

    pub fn index(&self) -> &Arc<SubscriptionIndex<Route>> {
        &self.index
    }

    /// Subscribes `subscriber` to events from `source`.
    ///
    /// Re-subscribing the same (source, subscriber) pair replaces the
    /// previous filter and handler.
    pub fn subscribe(&self, subscriber: Subscriber, source: EventSource, filter: Option<Filter>) -> Result<()> {
        match &subscriber.handler {
            DeliveryHandler::Reply { .. } if self.replies.is_none() => {
                return Err(BusError::MissingSink("reply"))
            }
            DeliveryHandler::Session { .. } if self.sessions.is_none() => {
                return Err(BusError::MissingSink("session"))
            }
            _ => {}
        }

        debug!(subscriber = %subscriber.id, source = %source, "Subscribing");
        let route = Route {
            handler: subscriber.handler,
            principal: subscriber.principal,
        };
        self.index
            .insert(Subscription::new(source, subscriber.id, filter, route)?);
        Ok(())
    }

    /// Removes every subscription of `subscriber`.
    pub fn unsubscribe(&self, subscriber: &SubscriberId) -> usize {
        let removed = self.index.remove_by_subscriber(subscriber);
        debug!(subscriber = %subscriber, removed, "Unsubscribed");
        removed
    }

    /// Removes the subscriptions of `subscriber` whose filter selects
    /// `event_name`. Unfiltered subscriptions and other kinds are kept.
    pub fn unsubscribe_kind(&self, subscriber: &SubscriberId, event_name: EventName) -> usize {
        let pairs: Vec<(EventSource, SubscriberId)> = self
            .index
            .get_by_subscriber(subscriber)
            .iter()
            .filter(|s| s.filter().is_some_and(|f| f.event_name == event_name))
            .map(|s| (s.event_source().clone(), subscriber.clone()))
            .collect();
        let removed = self.index.remove_pairs(pairs);
        debug!(subscriber = %subscriber, event = %event_name, removed, "Unsubscribed");
        removed
    }

    pub fn unsubscribe_from(&self, source: &EventSource, subscriber: &SubscriberId) -> bool {
        self.index.remove(source, subscriber).is_some()
    }

    pub fn unsubscribe_pairs<I>(&self, pairs: I) -> usize
    where
        I: IntoIterator<Item = (EventSource, SubscriberId)>,
    {
        self.index.remove_pairs(pairs)
    }

    /// Removes every subscription on `source` (e.g. a deleted device).
    pub fn unsubscribe_source(&self, source: &EventSource) -> usize {
        let removed = self.index.remove_by_event_source(source);
        debug!(source = %source, removed, "Source unsubscribed");
        removed
    }

    /// Subscribers registered on exactly `source`, with their filters.
    pub fn subscriptions(&self, source: &EventSource) -> Vec<(SubscriberId, Option<Filter>)> {
        self.index
            .get_by_source(source)
            .iter()
            .map(|s| (s.subscriber_id().clone(), s.filter().cloned()))
            .collect()
    }

    /// Sources `subscriber` is registered on, with their filters.
    pub fn subscriptions_of(&self, subscriber: &SubscriberId) -> Vec<(EventSource, Option<Filter>)> {
        self.index
            .get_by_subscriber(subscriber)
            .iter()
            .map(|s| (s.event_source().clone(), s.filter().cloned()))
            .collect()
    }

    /// Queues delivery of `event` to every matching, authorized subscriber.
    ///
    /// Device-specific and wildcard subscriptions are filtered separately,
    /// then merged; a subscriber whose entries both match receives the event
    /// once, through the device-specific one.
    #[tracing::instrument(
        name = "bus.publish",
        skip_all,
        fields(device_id = %event.device_id(), event = %event.event_name())
    )]
    pub fn publish(&self, event: DeviceEvent) -> Result<PublishResult> {
        let source = EventSource::device(event.device_id());
        let event_name = event.event_name();
        let item_name = event.item_name();
        let event = Arc::new(event);

        let mut result = PublishResult::default();
        let mut matched: HashSet<SubscriberId> = HashSet::new();
        for subscription in self.index.candidates(&source) {
            if matched.contains(subscription.subscriber_id()) {
                result.duplicates += 1;
                continue;
            }
            if !subscription.accepts(event_name, &item_name) {
                result.filtered += 1;
                continue;
            }

            let route = subscription.handler();
            if let Some(principal) = &route.principal {
                if !self.access.has_access(principal, &source) {
                    debug!(
                        subscriber = %subscription.subscriber_id(),
                        principal = %principal.as_str(),
                        "Access denied, skipping delivery"
                    );
                    result.denied += 1;
                    continue;
                }
            }

            let job = Delivery {
                subscriber: subscription.subscriber_id().clone(),
                handler: route.handler.clone(),
                event: Arc::clone(&event),
                replies: self.replies.clone(),
                sessions: self.sessions.clone(),
            };
            self.executor.execute(move || job.run())?;
            matched.insert(subscription.subscriber_id().clone());
            result.scheduled += 1;
        }

        debug!(scheduled = result.scheduled, "Event published");
        Ok(result)
    }
}

/// One queued delivery.
struct Delivery {
    subscriber: SubscriberId,
    handler: DeliveryHandler,
    event: Arc<DeviceEvent>,
    replies: Option<Arc<dyn ReplySink>>,
    sessions: Option<Arc<dyn SessionSink>>,
}

impl Delivery {
    fn run(self) {
        let outcome = match &self.handler {
            DeliveryHandler::Reply {
                reply_to,
                correlation_id,
            } => match &self.replies {
                Some(sink) => sink.reply(
                    reply_to,
                    Response::partial(correlation_id.clone(), self.event.to_body()),
                ),
                None => Err(BusError::MissingSink("reply")),
            },
            DeliveryHandler::Session { destination } => match &self.sessions {
                Some(sink) => {
                    let message = self.event.session_message(self.subscriber.as_str());
                    sink.deliver(message.to_string(), destination)
                }
                None => Err(BusError::MissingSink("session")),
            },
            DeliveryHandler::Callback(callback) => {
                callback(&self.event);
                Ok(())
            }
        };

        if let Err(e) = outcome {
            warn!(subscriber = %self.subscriber, error = %e, "Event delivery failed");
        }
    }
}

pub struct EventBusBuilder {
    executor: Arc<Executor>,
    index: Option<Arc<SubscriptionIndex<Route>>>,
    access: Option<Arc<dyn AccessCheck>>,
    replies: Option<Arc<dyn ReplySink>>,
    sessions: Option<Arc<dyn SessionSink>>,
}

impl EventBusBuilder {
    /// Share an existing index instead of creating one.
    pub fn with_index(mut self, index: Arc<SubscriptionIndex<Route>>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_access_check(mut self, access: Arc<dyn AccessCheck>) -> Self {
        self.access = Some(access);
        self
    }

    pub fn with_reply_sink(mut self, replies: Arc<dyn ReplySink>) -> Self {
        self.replies = Some(replies);
        self
    }

    pub fn with_session_sink(mut self, sessions: Arc<dyn SessionSink>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn build(self) -> EventBus {
        EventBus {
            index: self.index.unwrap_or_default(),
            executor: self.executor,
            access: self.access.unwrap_or_else(|| Arc::new(AllowAll)),
            replies: self.replies,
            sessions: self.sessions,
        }
    }
}

#[cfg(test)]
mod tests;
