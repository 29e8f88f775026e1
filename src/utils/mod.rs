//! Shared helpers.
//!
//! Stateless functions used by the binary, the RPC loops, and tests.

pub mod bootstrap;
pub mod retry;
