//! An event-driven networking layer with reliable, resumable sessions on top of TCP.
//!
//! ## Architecture
//!
//! All work is done by three *pumps*, each a single thread binding an event source to an
//!  event handler:
//! * the I/O pump turns OS readiness (via `mio`) into accepted, connected, read and written
//!    data, and closes transports
//! * the timer pump forwards due timers into the protocol engine's queue
//! * the protocol pump runs the protocol engine, which owns all session state
//!
//! Pumps talk to each other exclusively by posting [event::Event]s to each other's queues.
//!  Handlers never block on I/O, and session state is never shared between threads.
//!
//! ## Sessions
//!
//! A session is a conversation between a client and a server that outlives individual TCP
//!  connections. Each data packet carries a sequence number; receivers deliver packets in
//!  sequence, request missing packets with a NACK and acknowledge delivered packets
//!  cumulatively with an ACK. Senders keep packets until they are acknowledged, so that a
//!  session can be resumed on a new connection after a network failure without losing or
//!  duplicating data.
//!
//! ## Wire format
//!
//! Every frame is a single packet. All numbers are big-endian.
//!
//! ```ascii
//!  0: sequence number (u16)
//!  2: flags (u8)
//!       0x01 ACK         sequence = highest sequence number delivered in order
//!       0x02 NACK        sequence = missing sequence number
//!       0x04 GREETING    client's first frame on a connection
//!       0x08 WELCOME     server's reply to a GREETING
//!       0x10 DISCONNECT  payload: reason (u8), 0 for a regular disconnect
//!       0x20 KEEPALIVE
//!       0x40 RESENT      data packet that is a retransmission
//!       0x80 reserved, must be 0
//!     At most one of the control bits (ACK to KEEPALIVE) is set. A frame without control bits
//!      is an application data packet.
//!  3: payload length (u32)
//!  7: payload
//! ```
//!
//! GREETING and WELCOME payloads start with the magic number 0x4E45_5650 ("NEVP") and the
//!  protocol version, see [packet::codec] for details.

pub mod buffers;
pub mod config;
pub mod end_point;
pub mod engine;
pub mod event;
pub mod handlers;
pub mod packet;
pub mod reactor;
pub mod session;
pub mod test_util;
pub mod transport;
