//! Protocol error types

use std::fmt;

use super::ConnectReturnCode;

/// A complete frame that cannot be turned into a packet.
///
/// Running out of bytes is not an error: the decoder reports that as
/// `Ok(None)` and waits for more input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Packet type 0 or 15
    UnknownPacketType(u8),
    /// Remaining length spills into a fifth byte
    RemainingLengthOverflow,
    /// CONNECT protocol name is neither "MQTT" nor "MQIsdp"
    UnknownProtocol,
    /// Known protocol name with a level this broker does not speak
    UnsupportedLevel(u8),
    InvalidQoS(u8),
    InvalidUtf8,
    /// Fixed header or CONNECT flags with reserved bits set
    ReservedFlags,
    Malformed(&'static str),
    /// Remaining length above the configured limit
    TooLarge { size: usize, max: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownPacketType(t) => write!(f, "unknown packet type {}", t),
            Self::RemainingLengthOverflow => f.write_str("remaining length longer than 4 bytes"),
            Self::UnknownProtocol => f.write_str("unknown protocol name"),
            Self::UnsupportedLevel(level) => write!(f, "unsupported protocol level {}", level),
            Self::InvalidQoS(q) => write!(f, "invalid QoS {}", q),
            Self::InvalidUtf8 => f.write_str("string is not valid UTF-8"),
            Self::ReservedFlags => f.write_str("reserved flag bits set"),
            Self::Malformed(what) => write!(f, "malformed packet: {}", what),
            Self::TooLarge { size, max } => {
                write!(f, "packet of {} bytes exceeds limit of {}", size, max)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Body does not fit a 4-byte remaining length
    RemainingLengthOverflow(usize),
    /// String or binary field longer than its u16 length prefix allows
    FieldTooLong(usize),
    /// QoS 1/2 PUBLISH without a packet identifier
    MissingPacketId,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemainingLengthOverflow(len) => {
                write!(f, "body of {} bytes does not fit a remaining length", len)
            }
            Self::FieldTooLong(len) => write!(f, "field of {} bytes exceeds 65535", len),
            Self::MissingPacketId => f.write_str("QoS > 0 publish requires a packet id"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Reasons the broker ends a connection at the MQTT level
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// CONNECT answered with a refusing CONNACK
    Refused(ConnectReturnCode),
    /// Well-formed packet that breaks the session rules
    Violation(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Refused(code) => write!(f, "connection refused ({:?})", code),
            Self::Violation(what) => write!(f, "protocol violation: {}", what),
        }
    }
}

impl std::error::Error for ProtocolError {}
