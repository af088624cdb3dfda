use std::fmt::{Display, Formatter};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Protocol-level errors. These are fatal to a session and are sent to the peer in WELCOME and
///  DISCONNECT frames, so the numeric values are part of the wire format. 0 is reserved for
///  'no error'.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum SessionErrorCode {
    BadMagic = 1,
    BadVersion = 2,
    /// a resume request for an unknown session id, or a request for an unknown session
    BadSession = 3,
    BadAuth = 4,
    /// a NACK for a sequence number that is no longer available for retransmission
    BadNack = 5,
    /// malformed frame or unexpected frame type
    BadMessageCode = 6,
    /// a gap in the received sequence could not be filled
    MissingSequence = 7,
    SessionTimeout = 8,
    ConnectFailed = 9,
}

impl Display for SessionErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionErrorCode::BadMagic => "BAD_MAGIC",
            SessionErrorCode::BadVersion => "BAD_VERSION",
            SessionErrorCode::BadSession => "BAD_SESSION",
            SessionErrorCode::BadAuth => "BAD_AUTH",
            SessionErrorCode::BadNack => "BAD_NACK",
            SessionErrorCode::BadMessageCode => "BAD_MESSAGE_CODE",
            SessionErrorCode::MissingSequence => "MISSING_SEQUENCE",
            SessionErrorCode::SessionTimeout => "SESSION_TIMEOUT",
            SessionErrorCode::ConnectFailed => "CONNECT_FAILED",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_values() {
        assert_eq!(u8::from(SessionErrorCode::BadNack), 5);
        assert_eq!(SessionErrorCode::try_from(7).ok(), Some(SessionErrorCode::MissingSequence));
        assert!(SessionErrorCode::try_from(0).is_err());
        assert!(SessionErrorCode::try_from(10).is_err());
    }
}
