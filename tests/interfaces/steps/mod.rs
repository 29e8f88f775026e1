//! Step definitions for interface tests.

pub mod delivery;
