use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::unexpected_body;
use crate::bus::EventBus;
use crate::model::{Action, Body, DeviceDeleteResponse, Request, Response};
use crate::rpc::{HandlerError, RequestHandler};
use crate::subscription::EventSource;

/// Drops every subscription bound to a deleted device.
///
/// Wildcard subscriptions are untouched; they simply stop seeing events
/// from that device.
pub struct DeviceDeleteHandler {
    bus: Arc<EventBus>,
}

impl DeviceDeleteHandler {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl RequestHandler for DeviceDeleteHandler {
    async fn handle(&self, request: Request) -> Result<Response, HandlerError> {
        let Some(Body::DeviceDeleteRequest(body)) = &request.body else {
            return Err(unexpected_body(&request, Action::DeviceDeleteRequest));
        };
        if body.device_id.is_empty() {
            return Err(HandlerError::BadRequest("device id must not be empty".to_string()));
        }

        let removed = self
            .bus
            .unsubscribe_source(&EventSource::device(body.device_id.as_str()));
        info!(device_id = %body.device_id, removed, "Device subscriptions removed");

        Ok(Response::success(
            request.correlation_id.clone(),
            Body::DeviceDeleteResponse(DeviceDeleteResponse {
                device_id: body.device_id.clone(),
                removed_subscriptions: removed,
            }),
        ))
    }
}
