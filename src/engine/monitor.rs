#[cfg(test)] use mockall::automock;
use crate::packet::packet::Packet;
use crate::packet::sequence::SequenceNumber;
use crate::session::error_code::SessionErrorCode;
use crate::session::session::SessionKey;

/// Observes the protocol engine, e.g. for collecting metrics. All methods default to doing
///  nothing, and the engine uses [NoopMonitor] unless a monitor is passed in explicitly.
#[cfg_attr(test, automock)]
pub trait ProtocolMonitor: Send {
    fn packet_sent(&self, _session: SessionKey, _packet: &Packet) {}
    fn packet_received(&self, _session: SessionKey, _packet: &Packet) {}
    fn packet_retransmitted(&self, _session: SessionKey, _sequence: SequenceNumber) {}
    fn session_error(&self, _session: SessionKey, _code: SessionErrorCode) {}
}

pub struct NoopMonitor;

impl ProtocolMonitor for NoopMonitor {}
