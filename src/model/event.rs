//! Server events fanned out by the event bus.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::body::{Body, CommandPayload, NotificationPayload};
use super::device::{DeviceCommand, DeviceNotification};

/// Kind of event a subscription filters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventName {
    NotificationEvent,
    CommandEvent,
    CommandUpdateEvent,
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventName::NotificationEvent => "NOTIFICATION_EVENT",
            EventName::CommandEvent => "COMMAND_EVENT",
            EventName::CommandUpdateEvent => "COMMAND_UPDATE_EVENT",
        };
        f.write_str(name)
    }
}

/// An event published to the bus, always tied to one device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Notification(DeviceNotification),
    Command(DeviceCommand),
    CommandUpdate(DeviceCommand),
}

impl DeviceEvent {
    pub fn event_name(&self) -> EventName {
        match self {
            DeviceEvent::Notification(_) => EventName::NotificationEvent,
            DeviceEvent::Command(_) => EventName::CommandEvent,
            DeviceEvent::CommandUpdate(_) => EventName::CommandUpdateEvent,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            DeviceEvent::Notification(n) => &n.device_id,
            DeviceEvent::Command(c) | DeviceEvent::CommandUpdate(c) => &c.device_id,
        }
    }

    /// The name a subscription's name filter is matched against.
    ///
    /// Notifications and commands match on their name; command updates
    /// match on the id of the command being followed.
    pub fn item_name(&self) -> String {
        match self {
            DeviceEvent::Notification(n) => n.notification.clone(),
            DeviceEvent::Command(c) => c.command.clone(),
            DeviceEvent::CommandUpdate(c) => c.id.to_string(),
        }
    }

    /// The body sent to reply-topic subscribers.
    pub fn to_body(&self) -> Body {
        match self {
            DeviceEvent::Notification(n) => Body::NotificationEvent(NotificationPayload {
                notification: n.clone(),
            }),
            DeviceEvent::Command(c) => Body::CommandEvent(CommandPayload { command: c.clone() }),
            DeviceEvent::CommandUpdate(c) => {
                Body::CommandUpdateEvent(CommandPayload { command: c.clone() })
            }
        }
    }

    /// The JSON message pushed to a live client session.
    pub fn session_message(&self, subscription_id: &str) -> Value {
        match self {
            DeviceEvent::Notification(n) => json!({
                "action": "notification/insert",
                "subscriptionId": subscription_id,
                "notification": n,
            }),
            DeviceEvent::Command(c) => json!({
                "action": "command/insert",
                "subscriptionId": subscription_id,
                "command": c,
            }),
            DeviceEvent::CommandUpdate(c) => json!({
                "action": "command/update",
                "subscriptionId": subscription_id,
                "command": c,
            }),
        }
    }
}
