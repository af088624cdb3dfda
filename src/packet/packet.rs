use std::fmt::{Debug, Formatter};
use bitflags::bitflags;
use bytes::Bytes;
use crate::packet::sequence::SequenceNumber;

bitflags! {
    /// Control bits in a frame header. At most one of the control bits may be set; RESENT
    ///  marks a retransmitted data packet.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PacketFlags: u8 {
        const ACK        = 0x01;
        const NACK       = 0x02;
        const GREETING   = 0x04;
        const WELCOME    = 0x08;
        const DISCONNECT = 0x10;
        const KEEPALIVE  = 0x20;
        const RESENT     = 0x40;
    }
}

impl PacketFlags {
    pub const CONTROL_BITS: PacketFlags = PacketFlags::ACK
        .union(PacketFlags::NACK)
        .union(PacketFlags::GREETING)
        .union(PacketFlags::WELCOME)
        .union(PacketFlags::DISCONNECT)
        .union(PacketFlags::KEEPALIVE);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketKind {
    Data,
    Ack,
    Nack,
    Greeting,
    Welcome,
    Disconnect,
    KeepAlive,
}

/// The unit of the session protocol: a sequence number, flags and payload.
///
/// Data packets carry sequence numbers assigned by the sender; control packets use the sequence
///  field for their own purposes (e.g. the acknowledged sequence for ACK).
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    sequence: SequenceNumber,
    flags: PacketFlags,
    data: Bytes,
}

impl Packet {
    pub fn new(sequence: SequenceNumber, flags: PacketFlags, data: Bytes) -> Packet {
        Packet {
            sequence,
            flags,
            data,
        }
    }

    pub fn data(sequence: SequenceNumber, data: Bytes) -> Packet {
        Packet::new(sequence, PacketFlags::empty(), data)
    }

    pub fn control(flags: PacketFlags, sequence: SequenceNumber) -> Packet {
        Packet::new(sequence, flags, Bytes::new())
    }

    pub fn sequence(&self) -> SequenceNumber {
        self.sequence
    }

    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    pub fn payload(&self) -> &Bytes {
        &self.data
    }

    pub fn into_payload(self) -> Bytes {
        self.data
    }

    /// returns a copy of this packet with additional flags set - the payload is shared
    pub fn with_flags(&self, flags: PacketFlags) -> Packet {
        Packet::new(self.sequence, self.flags | flags, self.data.clone())
    }

    pub fn is_resent(&self) -> bool {
        self.flags.contains(PacketFlags::RESENT)
    }

    /// `None` if the flags are inconsistent, i.e. more than one control bit is set
    pub fn kind(&self) -> Option<PacketKind> {
        let control = self.flags & PacketFlags::CONTROL_BITS;
        if control.is_empty() {
            return Some(PacketKind::Data);
        }
        if self.is_resent() {
            return None;
        }

        [
            (PacketFlags::ACK, PacketKind::Ack),
            (PacketFlags::NACK, PacketKind::Nack),
            (PacketFlags::GREETING, PacketKind::Greeting),
            (PacketFlags::WELCOME, PacketKind::Welcome),
            (PacketFlags::DISCONNECT, PacketKind::Disconnect),
            (PacketFlags::KEEPALIVE, PacketKind::KeepAlive),
        ].into_iter()
            .find(|(f, _)| *f == control)
            .map(|(_, kind)| kind)
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Packet{{{} {:?} {} bytes}}", self.sequence, self.flags, self.data.len())
    }
}
