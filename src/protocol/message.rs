//! Application message, the unit routed between publishers and sessions

use std::sync::Arc;

use bytes::Bytes;

use super::{Properties, Publish, QoS, Will};

/// A message as seen by routing, retained storage and the injection API.
///
/// Unlike [`Publish`] it carries no packet identifier or DUP flag; those
/// belong to a single hop between the broker and one client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApplicationMessage {
    pub topic: Arc<str>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub properties: Properties,
}

impl ApplicationMessage {
    pub fn new(topic: impl Into<Arc<str>>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties
            .user_properties
            .push((key.into(), value.into()));
        self
    }

    /// Build the outgoing PUBLISH for one subscriber. The packet identifier
    /// is assigned later, when the message leaves the pending queue.
    pub fn to_publish(&self, qos: QoS, retain: bool, subscription_ids: &[u32]) -> Publish {
        let mut properties = self.properties.forwardable();
        properties
            .subscription_identifiers
            .extend_from_slice(subscription_ids);
        Publish {
            dup: false,
            qos,
            retain,
            topic: self.topic.clone(),
            packet_id: None,
            payload: self.payload.clone(),
            properties,
        }
    }
}

impl From<&Publish> for ApplicationMessage {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
            retain: publish.retain,
            properties: publish.properties.forwardable(),
        }
    }
}

impl From<Publish> for ApplicationMessage {
    fn from(publish: Publish) -> Self {
        Self::from(&publish)
    }
}

impl From<&Will> for ApplicationMessage {
    fn from(will: &Will) -> Self {
        Self {
            topic: Arc::from(will.topic.as_str()),
            payload: will.payload.clone(),
            qos: will.qos,
            retain: will.retain,
            properties: will.properties.forwardable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_publish_attaches_subscription_ids() {
        let message = ApplicationMessage::new("a/b", "x")
            .with_qos(QoS::ExactlyOnce)
            .with_user_property("origin", "test");

        let publish = message.to_publish(QoS::AtLeastOnce, false, &[4, 9]);
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        assert_eq!(publish.packet_id, None);
        assert_eq!(publish.properties.subscription_identifiers.as_slice(), &[4, 9]);
        assert_eq!(publish.properties.user_properties.len(), 1);
    }
}
