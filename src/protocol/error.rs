//! Protocol error types

use std::fmt;

use super::ReasonCode;

/// Protocol violations detected by the engine. Any of these closes the
/// connection without a response packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Packet the codec could not make sense of
    MalformedPacket(String),
    /// Well-formed packet that breaks a protocol rule
    ProtocolViolation(&'static str),
    /// Topic name or filter rejected by validation
    InvalidTopic(&'static str),
    /// Packet that is not allowed in the current connection state
    UnexpectedPacket(&'static str),
    /// CONNECT with a protocol name/level the engine does not speak
    UnsupportedProtocolVersion,
    /// Topic alias outside the negotiated range or never registered
    TopicAliasInvalid(u16),
}

impl ProtocolError {
    /// Reason code that best describes this violation
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Self::MalformedPacket(_) => ReasonCode::MalformedPacket,
            Self::InvalidTopic(_) => ReasonCode::TopicNameInvalid,
            Self::UnsupportedProtocolVersion => ReasonCode::UnsupportedProtocolVersion,
            Self::TopicAliasInvalid(_) => ReasonCode::TopicAliasInvalid,
            Self::ProtocolViolation(_) | Self::UnexpectedPacket(_) => ReasonCode::ProtocolError,
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
            Self::InvalidTopic(msg) => write!(f, "invalid topic: {}", msg),
            Self::UnexpectedPacket(name) => write!(f, "unexpected {} packet", name),
            Self::UnsupportedProtocolVersion => write!(f, "unsupported protocol version"),
            Self::TopicAliasInvalid(alias) => write!(f, "invalid topic alias: {}", alias),
        }
    }
}

impl std::error::Error for ProtocolError {}
