//! Device payloads carried inside request bodies and events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A notification emitted by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNotification {
    #[serde(default)]
    pub id: i64,
    pub device_id: String,
    /// Notification name, e.g. `alarm` or `heartbeat`.
    pub notification: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<i64>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameters: Value,
}

impl DeviceNotification {
    pub fn new(device_id: impl Into<String>, notification: impl Into<String>) -> Self {
        Self {
            id: 0,
            device_id: device_id.into(),
            notification: notification.into(),
            network_id: None,
            timestamp: Utc::now(),
            parameters: Value::Null,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// A command addressed to a device, and later updated with its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCommand {
    #[serde(default)]
    pub id: i64,
    pub device_id: String,
    /// Command name, e.g. `reboot`.
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<i64>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub result: Value,
    #[serde(default)]
    pub is_updated: bool,
}

impl DeviceCommand {
    pub fn new(device_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: 0,
            device_id: device_id.into(),
            command: command.into(),
            network_id: None,
            timestamp: Utc::now(),
            parameters: Value::Null,
            lifetime: None,
            status: None,
            result: Value::Null,
            is_updated: false,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Marks the command as updated with the given status and result.
    pub fn updated(mut self, status: impl Into<String>, result: Value) -> Self {
        self.status = Some(status.into());
        self.result = result;
        self.is_updated = true;
        self
    }
}
