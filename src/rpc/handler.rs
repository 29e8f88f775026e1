//! Request handlers and the action routing table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use super::HandlerError;
use crate::model::{Action, Request, Response};

/// Business logic for one or more actions.
///
/// Handlers run on server worker threads, each of which drives its own
/// single-threaded async runtime. Tasks spawned from a handler only make
/// progress while that handler is being awaited.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Result<Response, HandlerError>;
}

/// Adapts a synchronous closure into a [`RequestHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(Request) -> Result<Response, HandlerError> + Send + Sync + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F> RequestHandler for FnHandler<F>
where
    F: Fn(Request) -> Result<Response, HandlerError> + Send + Sync + 'static,
{
    async fn handle(&self, request: Request) -> Result<Response, HandlerError> {
        (self.0)(request)
    }
}

/// Immutable action-to-handler map, built once before the server starts.
#[derive(Default, Clone)]
pub struct HandlerTable {
    handlers: HashMap<Action, Arc<dyn RequestHandler>>,
}

impl HandlerTable {
    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder::default()
    }

    pub fn resolve(&self, action: Action) -> Option<&Arc<dyn RequestHandler>> {
        self.handlers.get(&action)
    }

    pub fn actions(&self) -> Vec<Action> {
        let mut actions: Vec<_> = self.handlers.keys().copied().collect();
        actions.sort();
        actions
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Default)]
pub struct HandlerTableBuilder {
    handlers: HashMap<Action, Arc<dyn RequestHandler>>,
}

impl HandlerTableBuilder {
    pub fn register<H>(self, action: Action, handler: H) -> Self
    where
        H: RequestHandler + 'static,
    {
        self.register_shared(action, Arc::new(handler))
    }

    /// Registers one handler instance for an action. Later registrations
    /// for the same action replace earlier ones.
    pub fn register_shared(mut self, action: Action, handler: Arc<dyn RequestHandler>) -> Self {
        if self.handlers.insert(action, handler).is_some() {
            warn!(action = %action, "Handler registered twice, keeping the last one");
        }
        self
    }

    pub fn build(self) -> HandlerTable {
        HandlerTable {
            handlers: self.handlers,
        }
    }
}
