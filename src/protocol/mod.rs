//! MQTT protocol model
//!
//! Decoded packet types shared by MQTT 3.1, 3.1.1 and 5.0. Byte layout is
//! owned by the codec collaborator; this module only carries the semantic
//! fields the engine acts on.

mod error;
mod message;
mod packet;
mod properties;
mod reason;

pub use error::ProtocolError;
pub use message::ApplicationMessage;
pub use packet::*;
pub use properties::Properties;
pub use reason::ReasonCode;

/// MQTT protocol version, as negotiated by CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ProtocolVersion {
    /// MQTT 3.1 (protocol name "MQIsdp", level 3)
    V310 = 3,
    /// MQTT 3.1.1 (protocol level 4)
    V311 = 4,
    /// MQTT 5.0 (protocol level 5)
    V5 = 5,
}

impl ProtocolVersion {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            3 => Some(ProtocolVersion::V310),
            4 => Some(ProtocolVersion::V311),
            5 => Some(ProtocolVersion::V5),
            _ => None,
        }
    }

    /// Detect the version from the CONNECT protocol name and level fields.
    /// Codecs call this before decoding the rest of CONNECT.
    pub fn detect(protocol_name: &str, level: u8) -> Option<Self> {
        match (protocol_name, level) {
            ("MQIsdp", 3) => Some(ProtocolVersion::V310),
            ("MQTT", 4) => Some(ProtocolVersion::V311),
            ("MQTT", 5) => Some(ProtocolVersion::V5),
            _ => None,
        }
    }

    #[inline]
    pub fn is_v5(self) -> bool {
        self == ProtocolVersion::V5
    }
}

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery
    AtLeastOnce = 1,
    /// Exactly once delivery
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    /// SUBACK reason code granting this QoS
    pub fn granted_reason(self) -> ReasonCode {
        match self {
            QoS::AtMostOnce => ReasonCode::Success,
            QoS::AtLeastOnce => ReasonCode::GrantedQoS1,
            QoS::ExactlyOnce => ReasonCode::GrantedQoS2,
        }
    }
}

/// Retain handling subscription option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RetainHandling {
    /// Replay retained messages on every SUBSCRIBE
    #[default]
    SendAtSubscribe = 0,
    /// Replay only when the filter was not subscribed before
    SendIfNew = 1,
    /// Never replay
    DoNotSend = 2,
}

impl RetainHandling {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RetainHandling::SendAtSubscribe),
            1 => Some(RetainHandling::SendIfNew),
            2 => Some(RetainHandling::DoNotSend),
            _ => None,
        }
    }
}

/// Per-filter subscription options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

impl SubscriptionOptions {
    pub fn with_qos(qos: QoS) -> Self {
        Self {
            qos,
            ..Default::default()
        }
    }
}
