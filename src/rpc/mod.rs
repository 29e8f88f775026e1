//! Request/response RPC over a partitioned log.
//!
//! This module contains:
//! - `RpcClient`: sends calls and pushes, matches responses to callbacks
//! - `RpcServer`: consumes requests, runs handlers on a worker pool, replies
//! - `RequestHandler`/`HandlerTable`: per-action business handlers
//! - `RequestResponseMatcher`: correlation id to pending-callback table
//! - `ResponseDispatcher`: writes responses to reply topics
//!
//! Every client owns a private reply topic. Requests carry that topic in
//! `reply_to` and the server echoes the request's correlation id, so
//! responses can be matched without any shared state between processes.

mod client;
mod dispatcher;
mod handler;
mod matcher;
mod server;

use std::time::Duration;

use serde::Deserialize;

use crate::bus::BusError;
use crate::model::CodecError;
use crate::ring::{RingConfig, RingError};
use crate::transport::TransportError;

pub use client::{ClientState, RpcClient};
pub use dispatcher::ResponseDispatcher;
pub use handler::{handler_fn, FnHandler, HandlerTable, HandlerTableBuilder, RequestHandler};
pub use matcher::{RequestResponseMatcher, ResponseCallback};
pub use server::RpcServer;

/// Error codes carried in error responses.
pub mod codes {
    pub const BAD_REQUEST: u16 = 400;
    pub const FORBIDDEN: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const INTERNAL: u16 = 500;
    pub const UNSUPPORTED: u16 = 501;
}

/// Result type for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("Request body must not be empty")]
    EmptyBody,

    #[error("Client is not running (state: {0:?})")]
    NotRunning(ClientState),

    #[error("RPC server is not reachable after {attempts} ping attempts")]
    Unreachable { attempts: u32 },

    #[error("Call {correlation_id} timed out after {timeout:?}")]
    Timeout {
        correlation_id: String,
        timeout: Duration,
    },

    #[error("Call {0} was cancelled")]
    Cancelled(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Ring error: {0}")]
    Ring(#[from] RingError),

    #[error("Thread or runtime setup failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure reported by a request handler, mapped to an error response.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn code(&self) -> u16 {
        match self {
            HandlerError::BadRequest(_) => codes::BAD_REQUEST,
            HandlerError::Forbidden(_) => codes::FORBIDDEN,
            HandlerError::NotFound(_) => codes::NOT_FOUND,
            HandlerError::Failed(_) => codes::INTERNAL,
        }
    }
}

impl From<BusError> for HandlerError {
    fn from(e: BusError) -> Self {
        let message = e.to_string();
        match e {
            BusError::Subscription(_) => HandlerError::BadRequest(message),
            _ => HandlerError::Failed(message),
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Server-side settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcServerConfig {
    /// Threads polling the request topic.
    pub consumer_threads: usize,
    /// Threads running request handlers.
    pub worker_threads: usize,
    /// Consumer group shared by every server instance.
    pub group_id: String,
    pub poll_timeout_ms: u64,
    pub ring: RingConfig,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            consumer_threads: 1,
            worker_threads: 4,
            group_id: "request-consumer-group".to_string(),
            poll_timeout_ms: 100,
            ring: RingConfig::default(),
        }
    }
}

/// Liveness probe performed when a client starts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    pub timeout_ms: u64,
    pub max_attempts: u32,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            max_attempts: 10,
        }
    }
}

/// Client-side settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcClientConfig {
    /// Threads polling the reply topic.
    pub response_consumer_threads: usize,
    /// Fixed reply topic. Generated from the prefix when unset.
    pub reply_topic: Option<String>,
    pub reply_topic_prefix: String,
    pub poll_timeout_ms: u64,
    /// Default timeout for `call_with_timeout`-style helpers.
    pub call_timeout_ms: u64,
    pub ping: PingConfig,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            response_consumer_threads: 1,
            reply_topic: None,
            reply_topic_prefix: "response_topic_".to_string(),
            poll_timeout_ms: 100,
            call_timeout_ms: 10_000,
            ping: PingConfig::default(),
        }
    }
}

impl RpcClientConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[cfg(test)]
mod tests;
