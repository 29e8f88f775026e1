//! Request/response bodies and the action catalogue.
//!
//! Every body variant is registered once in the table at the bottom of this
//! file. The table generates the [`Action`] discriminator, the [`Body`] sum
//! type, and the per-variant payload codec, so adding a body kind is a
//! single-line change that the compiler checks end to end.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::device::{DeviceCommand, DeviceNotification};
use super::CodecError;

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub notification: DeviceNotification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: DeviceCommand,
}

/// Subscribe a subscription id to notifications or commands.
///
/// An empty `device_ids` list subscribes to every device. An empty `names`
/// set accepts every notification/command name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub subscription_id: String,
    #[serde(default)]
    pub device_ids: Vec<String>,
    #[serde(default)]
    pub names: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResponse {
    pub subscription_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    pub subscription_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeResponse {
    pub subscription_ids: Vec<String>,
}

/// Follow updates of a single command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandUpdateSubscribeRequest {
    pub subscription_id: String,
    pub device_id: String,
    pub command_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDeleteRequest {
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDeleteResponse {
    pub device_id: String,
    pub removed_subscriptions: usize,
}

// ============================================================================
// Catalogue
// ============================================================================

macro_rules! body_catalogue {
    ($( $variant:ident($payload:ty) => $tag:literal, )+) => {
        /// Wire discriminator of a [`Body`].
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Action {
            $( $variant, )+
        }

        impl Action {
            /// Every registered action, in catalogue order.
            pub const ALL: &'static [Action] = &[ $( Action::$variant, )+ ];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Action::$variant => $tag, )+
                }
            }
        }

        impl FromStr for Action {
            type Err = CodecError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $tag => Ok(Action::$variant), )+
                    other => Err(CodecError::UnknownAction(other.to_string())),
                }
            }
        }

        /// Closed set of request/response/event bodies.
        #[derive(Debug, Clone, PartialEq)]
        pub enum Body {
            $( $variant($payload), )+
        }

        impl Body {
            pub fn action(&self) -> Action {
                match self {
                    $( Body::$variant(_) => Action::$variant, )+
                }
            }

            /// Decodes the payload of an already-resolved action.
            pub fn decode(action: Action, value: Value) -> Result<Self, CodecError> {
                match action {
                    $(
                        Action::$variant => serde_json::from_value(value)
                            .map(Body::$variant)
                            .map_err(|source| CodecError::Payload { action: $tag, source }),
                    )+
                }
            }

            /// Encodes the payload only; the discriminator travels in the envelope.
            pub fn encode(&self) -> Result<Value, CodecError> {
                let encoded = match self {
                    $( Body::$variant(payload) => serde_json::to_value(payload), )+
                };
                encoded.map_err(|source| CodecError::Payload {
                    action: self.action().as_str(),
                    source,
                })
            }
        }
    };
}

body_catalogue! {
    NotificationInsertRequest(NotificationPayload) => "NOTIFICATION_INSERT_REQUEST",
    NotificationInsertResponse(NotificationPayload) => "NOTIFICATION_INSERT_RESPONSE",
    NotificationSubscribeRequest(SubscribeRequest) => "NOTIFICATION_SUBSCRIBE_REQUEST",
    NotificationSubscribeResponse(SubscribeResponse) => "NOTIFICATION_SUBSCRIBE_RESPONSE",
    NotificationUnsubscribeRequest(UnsubscribeRequest) => "NOTIFICATION_UNSUBSCRIBE_REQUEST",
    NotificationUnsubscribeResponse(UnsubscribeResponse) => "NOTIFICATION_UNSUBSCRIBE_RESPONSE",
    NotificationEvent(NotificationPayload) => "NOTIFICATION_EVENT",
    CommandInsertRequest(CommandPayload) => "COMMAND_INSERT_REQUEST",
    CommandInsertResponse(CommandPayload) => "COMMAND_INSERT_RESPONSE",
    CommandUpdateRequest(CommandPayload) => "COMMAND_UPDATE_REQUEST",
    CommandUpdateResponse(CommandPayload) => "COMMAND_UPDATE_RESPONSE",
    CommandSubscribeRequest(SubscribeRequest) => "COMMAND_SUBSCRIBE_REQUEST",
    CommandSubscribeResponse(SubscribeResponse) => "COMMAND_SUBSCRIBE_RESPONSE",
    CommandUnsubscribeRequest(UnsubscribeRequest) => "COMMAND_UNSUBSCRIBE_REQUEST",
    CommandUnsubscribeResponse(UnsubscribeResponse) => "COMMAND_UNSUBSCRIBE_RESPONSE",
    CommandUpdateSubscribeRequest(CommandUpdateSubscribeRequest) => "COMMAND_UPDATE_SUBSCRIBE_REQUEST",
    CommandUpdateSubscribeResponse(SubscribeResponse) => "COMMAND_UPDATE_SUBSCRIBE_RESPONSE",
    CommandEvent(CommandPayload) => "COMMAND_EVENT",
    CommandUpdateEvent(CommandPayload) => "COMMAND_UPDATE_EVENT",
    DeviceDeleteRequest(DeviceDeleteRequest) => "DEVICE_DELETE_REQUEST",
    DeviceDeleteResponse(DeviceDeleteResponse) => "DEVICE_DELETE_RESPONSE",
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        tag.parse().map_err(serde::de::Error::custom)
    }
}
