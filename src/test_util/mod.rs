//! Utilities for testing code on top of the network layer without real sockets. They are used
//!  for testing the crate itself, but they are also exported for application testing.

pub mod memory_channel;
pub mod memory_connector;
