//! Subscribe and unsubscribe handlers.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::unexpected_body;
use crate::bus::{EventBus, Principal, Subscriber};
use crate::model::{
    Action, Body, EventName, Request, Response, SubscribeRequest, SubscribeResponse,
    UnsubscribeResponse,
};
use crate::rpc::{HandlerError, RequestHandler};
use crate::subscription::{EventSource, Filter, SubscriberId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Notifications,
    Commands,
}

impl Kind {
    fn event_name(self) -> EventName {
        match self {
            Kind::Notifications => EventName::NotificationEvent,
            Kind::Commands => EventName::CommandEvent,
        }
    }
}

fn reply_topic(request: &Request) -> Result<String, HandlerError> {
    request
        .reply_to
        .clone()
        .ok_or_else(|| HandlerError::BadRequest("subscription requires a reply topic".to_string()))
}

fn subscriber(request: &Request, reply_to: String, subscription_id: &str, principal: Option<&String>) -> Subscriber {
    let subscriber = Subscriber::reply(subscription_id, reply_to, request.correlation_id.clone());
    match principal {
        Some(name) => subscriber.with_principal(Principal::new(name.clone())),
        None => subscriber,
    }
}

/// Subscribes the caller to notifications or commands of some or all devices.
pub struct SubscribeHandler {
    bus: Arc<EventBus>,
    kind: Kind,
}

impl SubscribeHandler {
    pub fn notifications(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            kind: Kind::Notifications,
        }
    }

    pub fn commands(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            kind: Kind::Commands,
        }
    }

    fn body<'a>(&self, request: &'a Request) -> Result<&'a SubscribeRequest, HandlerError> {
        match (self.kind, &request.body) {
            (Kind::Notifications, Some(Body::NotificationSubscribeRequest(body))) => Ok(body),
            (Kind::Commands, Some(Body::CommandSubscribeRequest(body))) => Ok(body),
            (Kind::Notifications, _) => Err(unexpected_body(request, Action::NotificationSubscribeRequest)),
            (Kind::Commands, _) => Err(unexpected_body(request, Action::CommandSubscribeRequest)),
        }
    }
}

#[async_trait]
impl RequestHandler for SubscribeHandler {
    async fn handle(&self, request: Request) -> Result<Response, HandlerError> {
        let body = self.body(&request)?;
        let reply_to = reply_topic(&request)?;

        let event_name = self.kind.event_name();
        let filter = Filter::new(event_name).with_names(body.names.iter().cloned());
        let subscriber = subscriber(&request, reply_to, &body.subscription_id, body.principal.as_ref());

        let sources: Vec<EventSource> = if body.device_ids.is_empty() {
            vec![EventSource::All]
        } else {
            body.device_ids.iter().map(EventSource::device).collect()
        };
        for source in sources {
            self.bus
                .subscribe(subscriber.clone(), source, Some(filter.clone()))?;
        }

        info!(
            subscription_id = %body.subscription_id,
            event = %event_name,
            devices = body.device_ids.len(),
            "Subscribed"
        );

        let ack = SubscribeResponse {
            subscription_id: body.subscription_id.clone(),
        };
        let ack = match self.kind {
            Kind::Notifications => Body::NotificationSubscribeResponse(ack),
            Kind::Commands => Body::CommandSubscribeResponse(ack),
        };
        Ok(Response::partial(request.correlation_id.clone(), ack))
    }
}

/// Removes subscriptions by id, limited to the handler's event kind.
pub struct UnsubscribeHandler {
    bus: Arc<EventBus>,
    kind: Kind,
}

impl UnsubscribeHandler {
    pub fn notifications(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            kind: Kind::Notifications,
        }
    }

    pub fn commands(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            kind: Kind::Commands,
        }
    }
}

#[async_trait]
impl RequestHandler for UnsubscribeHandler {
    async fn handle(&self, request: Request) -> Result<Response, HandlerError> {
        let body = match (self.kind, &request.body) {
            (Kind::Notifications, Some(Body::NotificationUnsubscribeRequest(body))) => body,
            (Kind::Commands, Some(Body::CommandUnsubscribeRequest(body))) => body,
            (Kind::Notifications, _) => {
                return Err(unexpected_body(&request, Action::NotificationUnsubscribeRequest))
            }
            (Kind::Commands, _) => {
                return Err(unexpected_body(&request, Action::CommandUnsubscribeRequest))
            }
        };

        for id in &body.subscription_ids {
            self.bus
                .unsubscribe_kind(&SubscriberId::new(id.as_str()), self.kind.event_name());
        }

        let result = UnsubscribeResponse {
            subscription_ids: body.subscription_ids.clone(),
        };
        let result = match self.kind {
            Kind::Notifications => Body::NotificationUnsubscribeResponse(result),
            Kind::Commands => Body::CommandUnsubscribeResponse(result),
        };
        Ok(Response::success(request.correlation_id.clone(), result))
    }
}

/// Follows updates of one command.
pub struct CommandUpdateSubscribeHandler {
    bus: Arc<EventBus>,
}

impl CommandUpdateSubscribeHandler {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl RequestHandler for CommandUpdateSubscribeHandler {
    async fn handle(&self, request: Request) -> Result<Response, HandlerError> {
        let Some(Body::CommandUpdateSubscribeRequest(body)) = &request.body else {
            return Err(unexpected_body(&request, Action::CommandUpdateSubscribeRequest));
        };
        let reply_to = reply_topic(&request)?;

        let filter = Filter::new(EventName::CommandUpdateEvent).with_names([body.command_id.to_string()]);
        let subscriber = subscriber(&request, reply_to, &body.subscription_id, body.principal.as_ref());
        self.bus.subscribe(
            subscriber,
            EventSource::device(body.device_id.as_str()),
            Some(filter),
        )?;

        Ok(Response::partial(
            request.correlation_id.clone(),
            Body::CommandUpdateSubscribeResponse(SubscribeResponse {
                subscription_id: body.subscription_id.clone(),
            }),
        ))
    }
}
