//! Delivery interface step definitions.

use std::collections::HashMap;
use std::sync::Arc;

use cucumber::{given, then, when, World};
use hiverelay::bus::{EventBus, Subscriber};
use hiverelay::delivery::{DeliverySink, LocalSessions};
use hiverelay::model::{DeviceCommand, DeviceEvent, DeviceNotification, EventName};
use hiverelay::ring::{Executor, RingConfig};
use hiverelay::subscription::{EventSource, Filter, SubscriberId};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;

/// Test context for delivery scenarios.
#[derive(World)]
#[world(init = Self::new)]
pub struct DeliveryWorld {
    executor: Arc<Executor>,
    sessions: Arc<LocalSessions>,
    sink: Arc<DeliverySink>,
    bus: EventBus,
    streams: HashMap<String, UnboundedReceiver<String>>,
    received: HashMap<String, Vec<Value>>,
    settled: bool,
}

impl std::fmt::Debug for DeliveryWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryWorld")
            .field("sessions", &self.sessions.len())
            .field("subscriptions", &self.bus.index().len())
            .field("settled", &self.settled)
            .finish()
    }
}

impl DeliveryWorld {
    fn new() -> Self {
        let executor = Arc::new(
            Executor::start("cucumber-bus", 2, &RingConfig::default()).expect("executor"),
        );
        let sessions = Arc::new(LocalSessions::new());
        let sink = Arc::new(
            DeliverySink::start(sessions.clone(), &RingConfig::default()).expect("delivery sink"),
        );
        let bus = EventBus::builder(Arc::clone(&executor))
            .with_session_sink(sink.clone())
            .build();
        Self {
            executor,
            sessions,
            sink,
            bus,
            streams: HashMap::new(),
            received: HashMap::new(),
            settled: false,
        }
    }

    /// Waits for every queued delivery to be written, then collects what
    /// each session received. Publishing is not possible afterwards.
    fn settle(&mut self) {
        if self.settled {
            return;
        }
        self.executor.shutdown();
        self.sink.shutdown();
        for (session, stream) in &mut self.streams {
            let messages = self.received.entry(session.clone()).or_default();
            while let Ok(message) = stream.try_recv() {
                messages.push(serde_json::from_str(&message).expect("session message is JSON"));
            }
        }
        self.settled = true;
    }

    fn subscribe(&mut self, subscriber: &str, session: &str, source: EventSource, names: &[String]) {
        let filter = Filter::new(EventName::NotificationEvent).with_names(names.iter().cloned());
        self.bus
            .subscribe(Subscriber::session(subscriber, session), source, Some(filter))
            .expect("subscribe");
    }

    fn publish(&mut self, event: DeviceEvent) {
        assert!(!self.settled, "cannot publish after deliveries settled");
        self.bus.publish(event).expect("publish");
    }
}

// ==========================================================================
// Background
// ==========================================================================

#[given("a running delivery pipeline")]
async fn given_pipeline(_world: &mut DeliveryWorld) {
    // Pipeline is started via World::new
}

#[given(expr = "an open session {string}")]
async fn given_open_session(world: &mut DeliveryWorld, session: String) {
    let stream = world.sessions.open(session.clone());
    world.streams.insert(session, stream);
}

// ==========================================================================
// Subscriptions
// ==========================================================================

#[given(expr = "subscriber {string} on session {string} follows notifications {string} of device {string}")]
async fn given_named_subscription(
    world: &mut DeliveryWorld,
    subscriber: String,
    session: String,
    name: String,
    device: String,
) {
    world.subscribe(&subscriber, &session, EventSource::device(device), &[name]);
}

#[given(expr = "subscriber {string} on session {string} follows every notification of device {string}")]
async fn given_device_subscription(
    world: &mut DeliveryWorld,
    subscriber: String,
    session: String,
    device: String,
) {
    world.subscribe(&subscriber, &session, EventSource::device(device), &[]);
}

#[given(expr = "subscriber {string} on session {string} follows every notification of every device")]
async fn given_wildcard_subscription(world: &mut DeliveryWorld, subscriber: String, session: String) {
    world.subscribe(&subscriber, &session, EventSource::All, &[]);
}

#[when(expr = "subscriber {string} unsubscribes")]
async fn when_unsubscribe(world: &mut DeliveryWorld, subscriber: String) {
    world.bus.unsubscribe(&SubscriberId::new(subscriber));
}

#[when(expr = "device {string} is deleted")]
async fn when_device_deleted(world: &mut DeliveryWorld, device: String) {
    world.bus.unsubscribe_source(&EventSource::device(device));
}

#[when(expr = "session {string} is closed")]
async fn when_session_closed(world: &mut DeliveryWorld, session: String) {
    world.sessions.close(&session);
}

// ==========================================================================
// Publishing
// ==========================================================================

#[when(expr = "notification {string} is published for device {string}")]
async fn when_notification_published(world: &mut DeliveryWorld, name: String, device: String) {
    world.publish(DeviceEvent::Notification(DeviceNotification::new(device, name)));
}

#[when(expr = "command {string} is published for device {string}")]
async fn when_command_published(world: &mut DeliveryWorld, name: String, device: String) {
    world.publish(DeviceEvent::Command(DeviceCommand::new(device, name)));
}

// ==========================================================================
// Outcomes
// ==========================================================================

#[then(regex = r#"^session "([^"]+)" receives exactly (\d+) messages?$"#)]
async fn then_session_receives(world: &mut DeliveryWorld, session: String, count: usize) {
    world.settle();
    let received = world.received.get(&session).map_or(0, Vec::len);
    assert_eq!(received, count, "messages on session {session}");
}

#[then(expr = "every message on session {string} references device {string} and item {string}")]
async fn then_messages_reference(world: &mut DeliveryWorld, session: String, device: String, item: String) {
    world.settle();
    let messages = world.received.get(&session).expect("session has messages");
    assert!(!messages.is_empty());
    for message in messages {
        assert_eq!(message["action"], "notification/insert");
        assert_eq!(message["notification"]["deviceId"], device.as_str());
        assert_eq!(message["notification"]["notification"], item.as_str());
        assert!(message["subscriptionId"].is_string());
    }
}

#[then(regex = r#"^the delivery sink dropped (\d+) messages?$"#)]
async fn then_sink_dropped(world: &mut DeliveryWorld, count: u64) {
    world.settle();
    assert_eq!(world.sink.stats().dropped, count);
}

#[then(regex = r#"^the delivery sink delivered (\d+) messages?$"#)]
async fn then_sink_delivered(world: &mut DeliveryWorld, count: u64) {
    world.settle();
    assert_eq!(world.sink.stats().delivered, count);
}
