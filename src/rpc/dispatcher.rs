//! Writes responses to reply topics.

use std::sync::Arc;

use tracing::debug;

use super::Result;
use crate::bus::{self, BusError, ReplySink};
use crate::model::Response;
use crate::transport::LogProducer;

/// Sends [`Response`]s to a caller's reply topic.
///
/// Cheap to clone; clones share the underlying producer.
#[derive(Clone)]
pub struct ResponseDispatcher {
    producer: Arc<dyn LogProducer>,
}

impl ResponseDispatcher {
    pub fn new(producer: Arc<dyn LogProducer>) -> Self {
        Self { producer }
    }

    pub fn send(&self, reply_to: &str, response: &Response, key: Option<&str>) -> Result<()> {
        let payload = response.encode()?;
        self.producer.send(reply_to, key, payload)?;
        debug!(
            reply_to = %reply_to,
            correlation_id = %response.correlation_id,
            last = response.last,
            "Response sent"
        );
        Ok(())
    }
}

impl ReplySink for ResponseDispatcher {
    /// Keys by correlation id so every response of one stream shares a partition.
    fn reply(&self, reply_to: &str, response: Response) -> bus::Result<()> {
        let key = response.correlation_id.clone();
        self.send(reply_to, &response, Some(&key))
            .map_err(|e| BusError::Reply(e.to_string()))
    }
}
