use super::*;
use crate::model::{DeviceCommand, DeviceNotification, EventName};
use crate::ring::RingConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

#[derive(Default)]
struct RecordingReplies {
    sent: Mutex<Vec<(String, Response)>>,
}

impl ReplySink for RecordingReplies {
    fn reply(&self, reply_to: &str, response: Response) -> Result<()> {
        self.sent.lock().push((reply_to.to_string(), response));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSessions {
    sent: Mutex<Vec<(String, String)>>,
}

impl SessionSink for RecordingSessions {
    fn deliver(&self, message: String, destination: &str) -> Result<()> {
        self.sent.lock().push((destination.to_string(), message));
        Ok(())
    }
}

struct DenyDevice(&'static str);

impl AccessCheck for DenyDevice {
    fn has_access(&self, _principal: &Principal, source: &EventSource) -> bool {
        *source != EventSource::device(self.0)
    }
}

fn executor() -> Arc<Executor> {
    Arc::new(Executor::start("bus-test", 2, &RingConfig::default()).unwrap())
}

fn counting(count: &Arc<AtomicUsize>) -> impl Fn(&DeviceEvent) + Send + Sync + 'static {
    let count = Arc::clone(count);
    move |_: &DeviceEvent| {
        count.fetch_add(1, Ordering::SeqCst);
    }
}

fn alarm(device: &str) -> DeviceEvent {
    DeviceEvent::Notification(DeviceNotification::new(device, "alarm"))
}

fn notification_filter(names: &[&str]) -> Option<Filter> {
    Some(Filter::new(EventName::NotificationEvent).with_names(names.iter().copied()))
}

#[test]
fn test_publish_delivers_to_matching_subscriber() {
    let executor = executor();
    let bus = EventBus::builder(Arc::clone(&executor)).build();
    let count = Arc::new(AtomicUsize::new(0));
    bus.subscribe(
        Subscriber::callback("s1", counting(&count)),
        EventSource::device("d1"),
        notification_filter(&["alarm"]),
    )
    .unwrap();

    let result = bus.publish(alarm("d1")).unwrap();
    executor.shutdown();

    assert_eq!(result.scheduled, 1);
    assert_eq!(result.duplicates, 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_wildcard_match_survives_rejecting_specific_filter() {
    let executor = executor();
    let bus = EventBus::builder(Arc::clone(&executor)).build();
    let count = Arc::new(AtomicUsize::new(0));
    let subscriber = Subscriber::callback("s1", counting(&count));
    bus.subscribe(
        subscriber.clone(),
        EventSource::device("d1"),
        notification_filter(&["heartbeat"]),
    )
    .unwrap();
    bus.subscribe(subscriber, EventSource::All, notification_filter(&[]))
        .unwrap();

    let result = bus.publish(alarm("d1")).unwrap();
    executor.shutdown();

    assert_eq!(result.filtered, 1);
    assert_eq!(result.scheduled, 1);
    assert_eq!(result.duplicates, 0);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_wildcard_match_survives_specific_filter_on_other_kind() {
    let executor = executor();
    let bus = EventBus::builder(Arc::clone(&executor)).build();
    let count = Arc::new(AtomicUsize::new(0));
    let subscriber = Subscriber::callback("s1", counting(&count));
    bus.subscribe(
        subscriber.clone(),
        EventSource::device("d1"),
        Some(Filter::new(EventName::CommandEvent)),
    )
    .unwrap();
    bus.subscribe(subscriber, EventSource::All, notification_filter(&["alarm"]))
        .unwrap();

    assert_eq!(bus.publish(alarm("d1")).unwrap().scheduled, 1);
    executor.shutdown();

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_both_matching_entries_deliver_through_specific() {
    let executor = executor();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let bus = EventBus::builder(Arc::clone(&executor)).build();
    let specific = Arc::clone(&seen);
    bus.subscribe(
        Subscriber::callback("s1", move |_| specific.lock().push("device")),
        EventSource::device("d1"),
        notification_filter(&["alarm"]),
    )
    .unwrap();
    let wildcard = Arc::clone(&seen);
    bus.subscribe(
        Subscriber::callback("s1", move |_| wildcard.lock().push("all")),
        EventSource::All,
        notification_filter(&[]),
    )
    .unwrap();

    let result = bus.publish(alarm("d1")).unwrap();
    executor.shutdown();

    assert_eq!(result.scheduled, 1);
    assert_eq!(*seen.lock(), vec!["device"]);
}

#[test]
fn test_filter_rejects_other_names_and_kinds() {
    let executor = executor();
    let bus = EventBus::builder(Arc::clone(&executor)).build();
    let count = Arc::new(AtomicUsize::new(0));
    bus.subscribe(
        Subscriber::callback("s1", counting(&count)),
        EventSource::device("d1"),
        notification_filter(&["alarm"]),
    )
    .unwrap();

    let heartbeat = DeviceEvent::Notification(DeviceNotification::new("d1", "heartbeat"));
    let command = DeviceEvent::Command(DeviceCommand::new("d1", "alarm"));
    assert_eq!(bus.publish(heartbeat).unwrap().filtered, 1);
    assert_eq!(bus.publish(command).unwrap().filtered, 1);
    executor.shutdown();

    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn test_other_device_not_delivered() {
    let executor = executor();
    let bus = EventBus::builder(Arc::clone(&executor)).build();
    let count = Arc::new(AtomicUsize::new(0));
    bus.subscribe(
        Subscriber::callback("s1", counting(&count)),
        EventSource::device("d1"),
        None,
    )
    .unwrap();

    let result = bus.publish(alarm("d2")).unwrap();
    executor.shutdown();

    assert_eq!(result, PublishResult::default());
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn test_wildcard_and_specific_deliver_once() {
    let executor = executor();
    let bus = EventBus::builder(Arc::clone(&executor)).build();
    let count = Arc::new(AtomicUsize::new(0));
    let subscriber = Subscriber::callback("s1", counting(&count));
    bus.subscribe(subscriber.clone(), EventSource::device("d1"), None)
        .unwrap();
    bus.subscribe(subscriber, EventSource::All, None).unwrap();

    let result = bus.publish(alarm("d1")).unwrap();
    executor.shutdown();

    assert_eq!(result.scheduled, 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_wildcard_receives_every_device() {
    let executor = executor();
    let bus = EventBus::builder(Arc::clone(&executor)).build();
    let count = Arc::new(AtomicUsize::new(0));
    bus.subscribe(
        Subscriber::callback("s1", counting(&count)),
        EventSource::All,
        None,
    )
    .unwrap();

    bus.publish(alarm("d1")).unwrap();
    bus.publish(alarm("d2")).unwrap();
    executor.shutdown();

    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn test_access_is_checked_at_publish_time() {
    let executor = executor();
    let bus = EventBus::builder(Arc::clone(&executor))
        .with_access_check(Arc::new(DenyDevice("d2")))
        .build();
    let count = Arc::new(AtomicUsize::new(0));
    bus.subscribe(
        Subscriber::callback("s1", counting(&count)).with_principal(Principal::new("alice")),
        EventSource::All,
        None,
    )
    .unwrap();

    assert_eq!(bus.publish(alarm("d1")).unwrap().scheduled, 1);
    assert_eq!(bus.publish(alarm("d2")).unwrap().denied, 1);
    executor.shutdown();

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reply_handler_sends_partial_response() {
    let executor = executor();
    let replies = Arc::new(RecordingReplies::default());
    let bus = EventBus::builder(Arc::clone(&executor))
        .with_reply_sink(replies.clone())
        .build();
    bus.subscribe(
        Subscriber::reply("s1", "response_topic_a", "corr-1"),
        EventSource::device("d1"),
        None,
    )
    .unwrap();

    bus.publish(alarm("d1")).unwrap();
    executor.shutdown();

    let sent = replies.sent.lock();
    assert_eq!(sent.len(), 1);
    let (reply_to, response) = &sent[0];
    assert_eq!(reply_to, "response_topic_a");
    assert_eq!(response.correlation_id, "corr-1");
    assert!(!response.last);
    assert_eq!(
        response.body.as_ref().map(|b| b.action()),
        Some(crate::model::Action::NotificationEvent)
    );
}

#[test]
fn test_session_handler_sends_session_message() {
    let executor = executor();
    let sessions = Arc::new(RecordingSessions::default());
    let bus = EventBus::builder(Arc::clone(&executor))
        .with_session_sink(sessions.clone())
        .build();
    bus.subscribe(
        Subscriber::session("s1", "session-42"),
        EventSource::device("d1"),
        None,
    )
    .unwrap();

    bus.publish(alarm("d1")).unwrap();
    executor.shutdown();

    let sent = sessions.sent.lock();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "session-42");
    let message: serde_json::Value = serde_json::from_str(&sent[0].1).unwrap();
    assert_eq!(message["subscriptionId"], "s1");
}

#[test]
fn test_subscribe_without_sink_fails_fast() {
    let bus = EventBus::builder(executor()).build();

    let result = bus.subscribe(
        Subscriber::reply("s1", "response_topic_a", "corr-1"),
        EventSource::device("d1"),
        None,
    );

    assert!(matches!(result, Err(BusError::MissingSink("reply"))));
    assert!(bus.index().is_empty());
}

#[test]
fn test_unsubscribe_variants() {
    let bus = EventBus::builder(executor()).build();
    for (source, id) in [
        ("d1", "s1"),
        ("d2", "s1"),
        ("d1", "s2"),
        ("d3", "s3"),
        ("d4", "s4"),
        ("d5", "s4"),
    ] {
        bus.subscribe(
            Subscriber::callback(id, |_| {}),
            EventSource::device(source),
            None,
        )
        .unwrap();
    }

    assert_eq!(bus.unsubscribe(&"s1".into()), 2);
    assert!(bus.unsubscribe_from(&EventSource::device("d1"), &"s2".into()));
    assert!(!bus.unsubscribe_from(&EventSource::device("d1"), &"s2".into()));
    assert_eq!(bus.unsubscribe_source(&EventSource::device("d3")), 1);
    let pairs = [
        (EventSource::device("d4"), SubscriberId::from("s4")),
        (EventSource::device("d5"), SubscriberId::from("s4")),
        (EventSource::device("d9"), SubscriberId::from("s4")),
    ];
    assert_eq!(bus.unsubscribe_pairs(pairs), 2);
    assert!(bus.index().is_empty());
}

#[test]
fn test_unsubscribe_kind_keeps_other_kinds() {
    let bus = EventBus::builder(executor()).build();
    bus.subscribe(
        Subscriber::callback("s1", |_| {}),
        EventSource::device("d1"),
        notification_filter(&["alarm"]),
    )
    .unwrap();
    bus.subscribe(
        Subscriber::callback("s1", |_| {}),
        EventSource::All,
        Some(Filter::new(EventName::CommandEvent)),
    )
    .unwrap();
    bus.subscribe(Subscriber::callback("s1", |_| {}), EventSource::device("d2"), None)
        .unwrap();

    assert_eq!(bus.unsubscribe_kind(&"s1".into(), EventName::NotificationEvent), 1);
    assert_eq!(bus.unsubscribe_kind(&"s1".into(), EventName::NotificationEvent), 0);

    let mut sources: Vec<EventSource> = bus
        .subscriptions_of(&"s1".into())
        .into_iter()
        .map(|(source, _)| source)
        .collect();
    sources.sort();
    assert_eq!(sources, vec![EventSource::All, EventSource::device("d2")]);
}

#[test]
fn test_subscriptions_listing() {
    let bus = EventBus::builder(executor()).build();
    bus.subscribe(
        Subscriber::callback("s1", |_| {}),
        EventSource::device("d1"),
        notification_filter(&["alarm"]),
    )
    .unwrap();

    let listed = bus.subscriptions(&EventSource::device("d1"));
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].0, SubscriberId::from("s1"));
    assert!(listed[0].1.as_ref().unwrap().names.contains("alarm"));

    let of = bus.subscriptions_of(&"s1".into());
    assert_eq!(of[0].0, EventSource::device("d1"));
}

#[test]
fn test_publish_does_not_run_handlers_inline() {
    let executor = executor();
    let bus = EventBus::builder(Arc::clone(&executor)).build();
    let publisher = thread::current().id();
    let ran_elsewhere = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&ran_elsewhere);
    bus.subscribe(
        Subscriber::callback("slow", move |_| {
            thread::sleep(Duration::from_millis(50));
            if thread::current().id() != publisher {
                flag.fetch_add(1, Ordering::SeqCst);
            }
        }),
        EventSource::device("d1"),
        None,
    )
    .unwrap();

    let started = std::time::Instant::now();
    bus.publish(alarm("d1")).unwrap();
    assert!(started.elapsed() < Duration::from_millis(50));

    executor.shutdown();
    assert_eq!(ran_elsewhere.load(Ordering::SeqCst), 1);
}
