//! Built-in request handlers.
//!
//! Subscribe handlers register the caller's reply topic with the event bus
//! and answer with a non-final acknowledgement: the call stays open and
//! every matching event arrives as another partial response until the
//! caller cancels it. Insert and update handlers publish to the bus and
//! answer once.

mod device;
mod insert;
mod subscribe;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::bus::EventBus;
use crate::model::{Action, Request};
use crate::rpc::{HandlerError, HandlerTable};

pub use device::DeviceDeleteHandler;
pub use insert::{CommandInsertHandler, CommandUpdateHandler, NotificationInsertHandler};
pub use subscribe::{CommandUpdateSubscribeHandler, SubscribeHandler, UnsubscribeHandler};

/// Table with every built-in handler wired to `bus`.
pub fn default_table(bus: Arc<EventBus>) -> HandlerTable {
    let ids = Arc::new(IdSequence::new());

    HandlerTable::builder()
        .register(
            Action::NotificationSubscribeRequest,
            SubscribeHandler::notifications(Arc::clone(&bus)),
        )
        .register(
            Action::CommandSubscribeRequest,
            SubscribeHandler::commands(Arc::clone(&bus)),
        )
        .register(
            Action::NotificationUnsubscribeRequest,
            UnsubscribeHandler::notifications(Arc::clone(&bus)),
        )
        .register(
            Action::CommandUnsubscribeRequest,
            UnsubscribeHandler::commands(Arc::clone(&bus)),
        )
        .register(
            Action::CommandUpdateSubscribeRequest,
            CommandUpdateSubscribeHandler::new(Arc::clone(&bus)),
        )
        .register(
            Action::NotificationInsertRequest,
            NotificationInsertHandler::new(Arc::clone(&bus), Arc::clone(&ids)),
        )
        .register(
            Action::CommandInsertRequest,
            CommandInsertHandler::new(Arc::clone(&bus), Arc::clone(&ids)),
        )
        .register(
            Action::CommandUpdateRequest,
            CommandUpdateHandler::new(Arc::clone(&bus)),
        )
        .register(Action::DeviceDeleteRequest, DeviceDeleteHandler::new(bus))
        .build()
}

/// Monotonic ids for notifications and commands that arrive without one.
pub struct IdSequence {
    next: AtomicI64,
}

impl IdSequence {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    /// Returns `id` unless it is unset (zero), in which case a fresh id.
    pub fn assign(&self, id: i64) -> i64 {
        if id != 0 {
            id
        } else {
            self.next.fetch_add(1, Ordering::Relaxed)
        }
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        Self::new()
    }
}

fn unexpected_body(request: &Request, expected: Action) -> HandlerError {
    HandlerError::BadRequest(format!(
        "expected {} body, got {}",
        expected,
        request
            .action()
            .map_or("none", |action| action.as_str())
    ))
}
