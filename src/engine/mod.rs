//! The protocol engine. It runs on the protocol pump and owns all session state.

pub mod monitor;
pub mod packet_io_handler;
