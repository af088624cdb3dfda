pub mod channel;
pub mod channel_transport;
