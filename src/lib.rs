//! hiverelay - RPC shim and pub/sub delivery engine for device backends.
//!
//! Requests travel over a partitioned log to an RPC server that dispatches
//! them by action to handlers; responses come back on a per-client reply
//! topic and are matched by correlation id. Device events published by
//! handlers fan out through a subscription index to reply topics, live
//! sessions, or in-process callbacks.

pub mod bus;
pub mod config;
pub mod delivery;
pub mod handlers;
pub mod model;
pub mod ring;
pub mod rpc;
pub mod subscription;
pub mod transport;
pub mod utils;
