//! MQTT v5.0 properties
//!
//! Only the decoded values are kept here. Which property is legal on which
//! packet is enforced by the codec; the engine reads and writes the fields
//! that influence delivery.

use bytes::Bytes;
use smallvec::SmallVec;

/// Property set shared by every packet type. Absent properties are `None`
/// (or empty) and are not encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Bytes>,
    /// Subscription identifiers: one on SUBSCRIBE, any number on outgoing PUBLISH
    pub subscription_identifiers: SmallVec<[u32; 2]>,
    pub session_expiry_interval: Option<u32>,
    pub assigned_client_identifier: Option<String>,
    pub server_keep_alive: Option<u16>,
    pub request_problem_information: Option<bool>,
    pub will_delay_interval: Option<u32>,
    pub request_response_information: Option<bool>,
    pub response_information: Option<String>,
    pub server_reference: Option<String>,
    pub reason_string: Option<String>,
    pub receive_maximum: Option<u16>,
    pub topic_alias_maximum: Option<u16>,
    pub topic_alias: Option<u16>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<bool>,
    pub user_properties: Vec<(String, String)>,
    pub maximum_packet_size: Option<u32>,
    pub wildcard_subscription_available: Option<bool>,
    pub subscription_identifiers_available: Option<bool>,
    pub shared_subscription_available: Option<bool>,
}

impl Properties {
    /// Keep only the properties that travel with an application message
    /// from publisher to subscriber.
    pub fn forwardable(&self) -> Self {
        Self {
            payload_format_indicator: self.payload_format_indicator,
            message_expiry_interval: self.message_expiry_interval,
            content_type: self.content_type.clone(),
            response_topic: self.response_topic.clone(),
            correlation_data: self.correlation_data.clone(),
            user_properties: self.user_properties.clone(),
            ..Default::default()
        }
    }

    /// Subscription identifier carried by a SUBSCRIBE packet
    pub fn subscription_identifier(&self) -> Option<u32> {
        self.subscription_identifiers.first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwardable_drops_connection_scoped_properties() {
        let props = Properties {
            response_topic: Some("reply/to".into()),
            topic_alias: Some(3),
            subscription_identifiers: SmallVec::from_slice(&[7]),
            user_properties: vec![("k".into(), "v".into())],
            ..Default::default()
        };

        let forwarded = props.forwardable();
        assert_eq!(forwarded.response_topic.as_deref(), Some("reply/to"));
        assert_eq!(forwarded.user_properties.len(), 1);
        assert_eq!(forwarded.topic_alias, None);
        assert!(forwarded.subscription_identifiers.is_empty());
    }
}
