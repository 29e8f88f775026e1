//! Wire model: request/response envelopes, bodies, and device events.

mod body;
mod device;
mod envelope;
mod event;

pub use body::{
    Action, Body, CommandPayload, CommandUpdateSubscribeRequest, DeviceDeleteRequest,
    DeviceDeleteResponse, NotificationPayload, SubscribeRequest, SubscribeResponse,
    UnsubscribeRequest, UnsubscribeResponse,
};
pub use device::{DeviceCommand, DeviceNotification};
pub use envelope::{DecodeError, Request, RequestType, Response, ResponseStatus};
pub use event::{DeviceEvent, EventName};

/// Errors from encoding or decoding wire messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("body present without an action")]
    MissingAction,

    #[error("invalid {action} payload: {source}")]
    Payload {
        action: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
