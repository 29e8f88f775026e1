//! Insert and update handlers: publish to the bus, answer once.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{unexpected_body, IdSequence};
use crate::bus::EventBus;
use crate::model::{Action, Body, CommandPayload, DeviceEvent, NotificationPayload, Request, Response};
use crate::rpc::{HandlerError, RequestHandler};

fn require_device(device_id: &str) -> Result<(), HandlerError> {
    if device_id.is_empty() {
        return Err(HandlerError::BadRequest("device id must not be empty".to_string()));
    }
    Ok(())
}

pub struct NotificationInsertHandler {
    bus: Arc<EventBus>,
    ids: Arc<IdSequence>,
}

impl NotificationInsertHandler {
    pub fn new(bus: Arc<EventBus>, ids: Arc<IdSequence>) -> Self {
        Self { bus, ids }
    }
}

#[async_trait]
impl RequestHandler for NotificationInsertHandler {
    async fn handle(&self, request: Request) -> Result<Response, HandlerError> {
        let Some(Body::NotificationInsertRequest(payload)) = &request.body else {
            return Err(unexpected_body(&request, Action::NotificationInsertRequest));
        };
        require_device(&payload.notification.device_id)?;

        let mut notification = payload.notification.clone();
        notification.id = self.ids.assign(notification.id);

        let published = self
            .bus
            .publish(DeviceEvent::Notification(notification.clone()))?;
        debug!(
            id = notification.id,
            device_id = %notification.device_id,
            scheduled = published.scheduled,
            "Notification inserted"
        );

        Ok(Response::success(
            request.correlation_id.clone(),
            Body::NotificationInsertResponse(NotificationPayload { notification }),
        ))
    }
}

pub struct CommandInsertHandler {
    bus: Arc<EventBus>,
    ids: Arc<IdSequence>,
}

impl CommandInsertHandler {
    pub fn new(bus: Arc<EventBus>, ids: Arc<IdSequence>) -> Self {
        Self { bus, ids }
    }
}

#[async_trait]
impl RequestHandler for CommandInsertHandler {
    async fn handle(&self, request: Request) -> Result<Response, HandlerError> {
        let Some(Body::CommandInsertRequest(payload)) = &request.body else {
            return Err(unexpected_body(&request, Action::CommandInsertRequest));
        };
        require_device(&payload.command.device_id)?;

        let mut command = payload.command.clone();
        command.id = self.ids.assign(command.id);

        let published = self.bus.publish(DeviceEvent::Command(command.clone()))?;
        debug!(
            id = command.id,
            device_id = %command.device_id,
            scheduled = published.scheduled,
            "Command inserted"
        );

        Ok(Response::success(
            request.correlation_id.clone(),
            Body::CommandInsertResponse(CommandPayload { command }),
        ))
    }
}

/// Publishes a command update to everyone following that command.
pub struct CommandUpdateHandler {
    bus: Arc<EventBus>,
}

impl CommandUpdateHandler {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl RequestHandler for CommandUpdateHandler {
    async fn handle(&self, request: Request) -> Result<Response, HandlerError> {
        let Some(Body::CommandUpdateRequest(payload)) = &request.body else {
            return Err(unexpected_body(&request, Action::CommandUpdateRequest));
        };
        require_device(&payload.command.device_id)?;
        if payload.command.id == 0 {
            return Err(HandlerError::BadRequest(
                "command update requires a command id".to_string(),
            ));
        }

        let mut command = payload.command.clone();
        command.is_updated = true;
        self.bus.publish(DeviceEvent::CommandUpdate(command.clone()))?;

        Ok(Response::success(
            request.correlation_id.clone(),
            Body::CommandUpdateResponse(CommandPayload { command }),
        ))
    }
}
