//! Pending-call table keyed by correlation id.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::model::Response;

pub type ResponseCallback = Arc<dyn Fn(Response) + Send + Sync>;

/// Routes responses to the callbacks of pending calls.
///
/// A callback stays registered across partial responses and is removed by
/// the first response with `last == true`, by [`remove`](Self::remove), or
/// by [`clear`](Self::clear). Callbacks run outside the table lock.
#[derive(Default)]
pub struct RequestResponseMatcher {
    pending: Mutex<HashMap<String, ResponseCallback>>,
}

impl RequestResponseMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for `correlation_id`, replacing any existing one.
    pub fn register<F>(&self, correlation_id: impl Into<String>, callback: F)
    where
        F: Fn(Response) + Send + Sync + 'static,
    {
        self.pending
            .lock()
            .insert(correlation_id.into(), Arc::new(callback));
    }

    /// Drops the pending call. Returns whether one was registered.
    pub fn remove(&self, correlation_id: &str) -> bool {
        self.pending.lock().remove(correlation_id).is_some()
    }

    /// Hands `response` to its pending call, if any.
    ///
    /// Returns `false` when nothing is waiting for this correlation id, as
    /// with duplicates or responses to calls that already timed out.
    pub fn offer(&self, response: Response) -> bool {
        let callback = {
            let mut pending = self.pending.lock();
            if response.last {
                pending.remove(&response.correlation_id)
            } else {
                pending.get(&response.correlation_id).cloned()
            }
        };

        let Some(callback) = callback else {
            debug!(correlation_id = %response.correlation_id, "No pending call for response, dropping");
            return false;
        };

        let correlation_id = response.correlation_id.clone();
        if panic::catch_unwind(AssertUnwindSafe(|| callback(response))).is_err() {
            error!(correlation_id = %correlation_id, "Response callback panicked");
        }
        true
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.pending.lock().contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Drops every pending call.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}
