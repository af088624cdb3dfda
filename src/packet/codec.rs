//! Frame encoding and decoding. See the crate documentation for the byte layout.

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;
use crate::buffers::received_data::ReceivedData;
use crate::packet::packet::{Packet, PacketFlags};
use crate::packet::sequence::SequenceNumber;
use crate::session::error_code::SessionErrorCode;
use crate::session::session::SessionId;

pub const HEADER_LEN: usize = 7;

/// "NEVP"
pub const MAGIC: u32 = 0x4E45_5650;
pub const PROTOCOL_VERSION: u8 = 1;

const RESERVED_FLAGS: u8 = 0x80;

/// auth tokens are length-prefixed with a u16
pub const MAX_AUTH_TOKEN_LEN: usize = u16::MAX as usize;
/// greeting payload size without the auth token
pub const MAX_GREETING_OVERHEAD: usize = 4 + 1 + 1 + 8 + 2 + 2;

pub fn encoded_len(packet: &Packet) -> usize {
    HEADER_LEN + packet.payload().len()
}

pub fn encode(packet: &Packet, buf: &mut BytesMut) {
    buf.reserve(encoded_len(packet));
    buf.put_u16(packet.sequence().to_raw());
    buf.put_u8(packet.flags().bits());
    buf.put_u32(packet.payload().len() as u32);
    buf.put_slice(packet.payload());
}

/// Decodes the next frame if it is completely available, leaving incomplete frames in place.
///  An error means the stream is corrupt and can not be resynchronized.
pub fn try_decode(data: &mut ReceivedData, max_payload_len: u32) -> anyhow::Result<Option<Packet>> {
    let mut header = [0u8; HEADER_LEN];
    if !data.peek(&mut header) {
        return Ok(None);
    }

    let mut header_buf: &[u8] = &header;
    let sequence = SequenceNumber::from_raw(header_buf.get_u16());
    let raw_flags = header_buf.get_u8();
    let payload_len = header_buf.get_u32();

    if raw_flags & RESERVED_FLAGS != 0 {
        bail!("reserved flag bits set: {:#04x}", raw_flags);
    }
    if payload_len > max_payload_len {
        bail!("payload length {} exceeds the maximum of {}", payload_len, max_payload_len);
    }
    let flags = PacketFlags::from_bits_truncate(raw_flags);

    let frame_len = HEADER_LEN + payload_len as usize;
    if data.remaining() < frame_len {
        trace!("incomplete frame: {} of {} bytes available", data.remaining(), frame_len);
        return Ok(None);
    }

    data.advance(HEADER_LEN);
    let payload = data.take(payload_len as usize);

    let packet = Packet::new(sequence, flags, payload);
    if packet.kind().is_none() {
        bail!("inconsistent flags {:?}", flags);
    }
    Ok(Some(packet))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResumeInfo {
    pub session_id: SessionId,
    /// the next sequence number the resuming client expects to receive
    pub receive_next: SequenceNumber,
}

/// The first frame a client sends on a new connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Greeting {
    pub resume: Option<ResumeInfo>,
    pub auth_token: Option<Bytes>,
}

impl Greeting {
    const OPT_RESUME: u8 = 0x01;
    const OPT_AUTH: u8 = 0x02;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(MAGIC);
        buf.put_u8(PROTOCOL_VERSION);

        let mut options = 0;
        if self.resume.is_some() {
            options |= Self::OPT_RESUME;
        }
        if self.auth_token.is_some() {
            options |= Self::OPT_AUTH;
        }
        buf.put_u8(options);

        if let Some(resume) = &self.resume {
            buf.put_u64(resume.session_id.to_raw());
            buf.put_u16(resume.receive_next.to_raw());
        }
        if let Some(token) = &self.auth_token {
            debug_assert!(token.len() <= MAX_AUTH_TOKEN_LEN);
            buf.put_u16(token.len() as u16);
            buf.put_slice(token);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> Result<Greeting, SessionErrorCode> {
        check_preamble(buf)?;

        let options = get_u8(buf)?;
        if options & !(Self::OPT_RESUME | Self::OPT_AUTH) != 0 {
            return Err(SessionErrorCode::BadMessageCode);
        }

        let resume = if options & Self::OPT_RESUME != 0 {
            Some(ResumeInfo {
                session_id: SessionId::from_raw(get_u64(buf)?),
                receive_next: SequenceNumber::from_raw(get_u16(buf)?),
            })
        }
        else {
            None
        };

        let auth_token = if options & Self::OPT_AUTH != 0 {
            let len = get_u16(buf)? as usize;
            if buf.remaining() < len {
                return Err(SessionErrorCode::BadMessageCode);
            }
            Some(buf.copy_to_bytes(len))
        }
        else {
            None
        };

        check_fully_consumed(buf)?;
        Ok(Greeting {
            resume,
            auth_token,
        })
    }
}

/// The server's reply to a greeting
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Welcome {
    /// `None` if the greeting was accepted
    pub rejection: Option<SessionErrorCode>,
    pub session_id: SessionId,
    /// the next sequence number the server expects to receive
    pub receive_next: SequenceNumber,
}

impl Welcome {
    pub fn accepted(session_id: SessionId, receive_next: SequenceNumber) -> Welcome {
        Welcome {
            rejection: None,
            session_id,
            receive_next,
        }
    }

    pub fn rejected(code: SessionErrorCode) -> Welcome {
        Welcome {
            rejection: Some(code),
            session_id: SessionId::from_raw(0),
            receive_next: SequenceNumber::ZERO,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(MAGIC);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.rejection.map(u8::from).unwrap_or(0));
        buf.put_u64(self.session_id.to_raw());
        buf.put_u16(self.receive_next.to_raw());
    }

    pub fn deser(buf: &mut impl Buf) -> Result<Welcome, SessionErrorCode> {
        check_preamble(buf)?;

        let rejection = parse_reason(get_u8(buf)?)?;
        let session_id = SessionId::from_raw(get_u64(buf)?);
        let receive_next = SequenceNumber::from_raw(get_u16(buf)?);
        check_fully_consumed(buf)?;

        Ok(Welcome {
            rejection,
            session_id,
            receive_next,
        })
    }
}

/// A DISCONNECT payload is a single byte: 0 for a regular disconnect, or the error code that
///  caused the disconnect
pub fn ser_disconnect_reason(reason: Option<SessionErrorCode>) -> Bytes {
    Bytes::copy_from_slice(&[reason.map(u8::from).unwrap_or(0)])
}

pub fn deser_disconnect_reason(buf: &mut impl Buf) -> Result<Option<SessionErrorCode>, SessionErrorCode> {
    let result = parse_reason(get_u8(buf)?)?;
    check_fully_consumed(buf)?;
    Ok(result)
}

fn parse_reason(raw: u8) -> Result<Option<SessionErrorCode>, SessionErrorCode> {
    if raw == 0 {
        return Ok(None);
    }
    SessionErrorCode::try_from(raw)
        .map(Some)
        .map_err(|_| SessionErrorCode::BadMessageCode)
}

fn check_preamble(buf: &mut impl Buf) -> Result<(), SessionErrorCode> {
    if get_u32(buf)? != MAGIC {
        return Err(SessionErrorCode::BadMagic);
    }
    if get_u8(buf)? != PROTOCOL_VERSION {
        return Err(SessionErrorCode::BadVersion);
    }
    Ok(())
}

fn check_fully_consumed(buf: &impl Buf) -> Result<(), SessionErrorCode> {
    if buf.has_remaining() {
        return Err(SessionErrorCode::BadMessageCode);
    }
    Ok(())
}

fn get_u8(buf: &mut impl Buf) -> Result<u8, SessionErrorCode> {
    if buf.remaining() < 1 {
        return Err(SessionErrorCode::BadMessageCode);
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut impl Buf) -> Result<u16, SessionErrorCode> {
    if buf.remaining() < 2 {
        return Err(SessionErrorCode::BadMessageCode);
    }
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut impl Buf) -> Result<u32, SessionErrorCode> {
    if buf.remaining() < 4 {
        return Err(SessionErrorCode::BadMessageCode);
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut impl Buf) -> Result<u64, SessionErrorCode> {
    if buf.remaining() < 8 {
        return Err(SessionErrorCode::BadMessageCode);
    }
    Ok(buf.get_u64())
}
