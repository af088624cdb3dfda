pub mod queue;

use std::fmt::{Display, Formatter};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use bytes::{Bytes, BytesMut};
use crate::packet::packet::Packet;
use crate::packet::sequence::SequenceNumber;
use crate::session::error_code::SessionErrorCode;
use crate::session::session::{SessionId, SessionKey};
use crate::transport::channel::Listener;
use crate::transport::channel_transport::ChannelTransport;

/// Why a transport is closed. Some reasons follow a final frame (WELCOME with an error code,
///  DISCONNECT) that should reach the peer, so the transmit queue is flushed before closing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// the peer closed the connection
    EndOfStream,
    ProtocolError,
    Disconnect,
    /// the session was resumed on a different transport
    Replaced,
    Timeout,
}

impl CloseReason {
    pub fn flush_first(self) -> bool {
        matches!(self, CloseReason::ProtocolError | CloseReason::Disconnect)
    }
}

/// Identifies what a timer event is for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerTag {
    /// the periodic timer driving acks, nack retries, keep-alive and timeouts
    Housekeeping,
    Reconnect(SessionKey),
}

/// The kind of an [Event], without payload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    AcceptPossible,
    ConnectPossible,
    ReadPossible,
    WritePossible,
    Accepted,
    AcceptError,
    Connected,
    ConnectError,
    InputDataPresent,
    ReadError,
    WriteError,
    CloseChannelRequest,
    ChannelClosed,
    Time,
    StartConnection,
    PacketWriteRequest,
    DisconnectRequest,
    NackRequest,
    SessionActive,
    SessionInactive,
    SessionEstablished,
    DataPacketReady,
    SessionError,
}

/// Everything that flows between pumps is an `Event`. Events are created by one stage and
///  consumed by exactly one handler; they are never modified after creation.
///
/// Byte buffers travel with the event that carries them: the consumer of an
///  [Event::InputDataPresent] owns the buffer and is responsible for returning it to the pool.
pub enum Event {
    // readiness, produced by the selector
    AcceptPossible { listener: Arc<Listener> },
    ConnectPossible { transport: Arc<ChannelTransport> },
    ReadPossible { transport: Arc<ChannelTransport> },
    WritePossible { transport: Arc<ChannelTransport> },

    // results of I/O operations, produced by the I/O handlers
    Accepted { transport: Arc<ChannelTransport> },
    AcceptError { cause: Arc<io::Error> },
    Connected { transport: Arc<ChannelTransport> },
    ConnectError { transport: Arc<ChannelTransport>, cause: Arc<io::Error> },
    InputDataPresent { transport: Arc<ChannelTransport>, data: BytesMut },
    ReadError { transport: Arc<ChannelTransport>, cause: Arc<io::Error> },
    WriteError { transport: Arc<ChannelTransport>, cause: Arc<io::Error> },
    CloseChannelRequest { transport: Arc<ChannelTransport>, reason: CloseReason },
    /// sent exactly once per transport, when it is actually closed. `cause` is the I/O error
    ///  that led to closing the transport, if any
    ChannelClosed { transport: Arc<ChannelTransport>, cause: Option<Arc<io::Error>> },

    Time { key: u64, tag: TimerTag },

    // requests to the protocol engine
    StartConnection { session: SessionKey, addr: SocketAddr },
    PacketWriteRequest { session: SessionKey, data: Bytes },
    DisconnectRequest { session: SessionKey },
    NackRequest { session: SessionKey, sequence: SequenceNumber },

    // notifications from the protocol engine to the application
    SessionActive { session: SessionKey },
    /// `permanent` is false if the session lost its transport but may still be resumed
    SessionInactive { session: SessionKey, session_id: Option<SessionId>, permanent: bool },
    SessionEstablished { session: SessionKey, session_id: SessionId, resumed: bool },
    DataPacketReady { session: SessionKey, session_id: SessionId, packet: Packet },
    SessionError { session: SessionKey, session_id: Option<SessionId>, code: SessionErrorCode, detail: String },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::AcceptPossible { .. } => EventKind::AcceptPossible,
            Event::ConnectPossible { .. } => EventKind::ConnectPossible,
            Event::ReadPossible { .. } => EventKind::ReadPossible,
            Event::WritePossible { .. } => EventKind::WritePossible,
            Event::Accepted { .. } => EventKind::Accepted,
            Event::AcceptError { .. } => EventKind::AcceptError,
            Event::Connected { .. } => EventKind::Connected,
            Event::ConnectError { .. } => EventKind::ConnectError,
            Event::InputDataPresent { .. } => EventKind::InputDataPresent,
            Event::ReadError { .. } => EventKind::ReadError,
            Event::WriteError { .. } => EventKind::WriteError,
            Event::CloseChannelRequest { .. } => EventKind::CloseChannelRequest,
            Event::ChannelClosed { .. } => EventKind::ChannelClosed,
            Event::Time { .. } => EventKind::Time,
            Event::StartConnection { .. } => EventKind::StartConnection,
            Event::PacketWriteRequest { .. } => EventKind::PacketWriteRequest,
            Event::DisconnectRequest { .. } => EventKind::DisconnectRequest,
            Event::NackRequest { .. } => EventKind::NackRequest,
            Event::SessionActive { .. } => EventKind::SessionActive,
            Event::SessionInactive { .. } => EventKind::SessionInactive,
            Event::SessionEstablished { .. } => EventKind::SessionEstablished,
            Event::DataPacketReady { .. } => EventKind::DataPacketReady,
            Event::SessionError { .. } => EventKind::SessionError,
        }
    }

    /// the transport this event refers to, if any
    pub fn transport(&self) -> Option<&Arc<ChannelTransport>> {
        match self {
            Event::ConnectPossible { transport } |
            Event::ReadPossible { transport } |
            Event::WritePossible { transport } |
            Event::Accepted { transport } |
            Event::Connected { transport } |
            Event::ConnectError { transport, .. } |
            Event::InputDataPresent { transport, .. } |
            Event::ReadError { transport, .. } |
            Event::WriteError { transport, .. } |
            Event::CloseChannelRequest { transport, .. } |
            Event::ChannelClosed { transport, .. } => Some(transport),
            _ => None,
        }
    }

    /// the session this event refers to, if any
    pub fn session(&self) -> Option<SessionKey> {
        match self {
            Event::StartConnection { session, .. } |
            Event::PacketWriteRequest { session, .. } |
            Event::DisconnectRequest { session } |
            Event::NackRequest { session, .. } |
            Event::SessionActive { session } |
            Event::SessionInactive { session, .. } |
            Event::SessionEstablished { session, .. } |
            Event::DataPacketReady { session, .. } |
            Event::SessionError { session, .. } => Some(*session),
            Event::Time { tag: TimerTag::Reconnect(session), .. } => Some(*session),
            _ => None,
        }
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::AcceptPossible { listener } => write!(f, "AcceptPossible[{:?}]", listener),
            Event::AcceptError { cause } => write!(f, "AcceptError[{}]", cause),
            Event::ConnectError { transport, cause } |
            Event::ReadError { transport, cause } |
            Event::WriteError { transport, cause } => write!(f, "{:?}[{:?}: {}]", self.kind(), transport, cause),
            Event::InputDataPresent { transport, data } => write!(f, "InputDataPresent[{:?}: {} bytes]", transport, data.len()),
            Event::CloseChannelRequest { transport, reason } => write!(f, "CloseChannelRequest[{:?}: {:?}]", transport, reason),
            Event::ChannelClosed { transport, cause: Some(cause) } => write!(f, "ChannelClosed[{:?}: {}]", transport, cause),
            Event::Time { key, tag } => write!(f, "Time[#{}: {:?}]", key, tag),
            Event::StartConnection { session, addr } => write!(f, "StartConnection[{} -> {}]", session, addr),
            Event::PacketWriteRequest { session, data } => write!(f, "PacketWriteRequest[{}: {} bytes]", session, data.len()),
            Event::NackRequest { session, sequence } => write!(f, "NackRequest[{}: {}]", session, sequence),
            Event::SessionInactive { session, permanent, .. } => write!(f, "SessionInactive[{}, permanent={}]", session, permanent),
            Event::SessionEstablished { session, session_id, resumed } => write!(f, "SessionEstablished[{} as {}, resumed={}]", session, session_id, resumed),
            Event::DataPacketReady { session, packet, .. } => write!(f, "DataPacketReady[{}: {:?}]", session, packet),
            Event::SessionError { session, code, detail, .. } => write!(f, "SessionError[{}: {} - {}]", session, code, detail),
            other => {
                if let Some(transport) = other.transport() {
                    write!(f, "{:?}[{:?}]", other.kind(), transport)
                }
                else if let Some(session) = other.session() {
                    write!(f, "{:?}[{}]", other.kind(), session)
                }
                else {
                    write!(f, "{:?}", other.kind())
                }
            }
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}
