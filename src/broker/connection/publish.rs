//! PUBLISH and PUBREL handling

use std::sync::Arc;

use tracing::{debug, trace};

use super::{Close, Connected, Connection};
use crate::broker::sessions::DispatchResult;
use crate::broker::transport::Transport;
use crate::protocol::{
    ApplicationMessage, Packet, Properties, ProtocolError, PubAck, PubComp, PubRec, PubRel,
    Publish, QoS, ReasonCode,
};
use crate::topic::validate_topic_name;

impl Connected {
    /// Resolve or register an inbound topic alias (v5). The alias property
    /// is consumed so it never reaches subscribers.
    fn resolve_topic_alias(
        &mut self,
        publish: &mut Publish,
        max_topic_alias: u16,
    ) -> Result<(), ProtocolError> {
        let Some(alias) = publish.properties.topic_alias.take() else {
            return Ok(());
        };
        if alias == 0 || alias > max_topic_alias {
            return Err(ProtocolError::TopicAliasInvalid(alias));
        }
        if publish.topic.is_empty() {
            match self.topic_aliases.get(&alias) {
                Some(topic) => publish.topic = topic.clone(),
                None => return Err(ProtocolError::TopicAliasInvalid(alias)),
            }
        } else {
            self.topic_aliases.insert(alias, publish.topic.clone());
        }
        Ok(())
    }
}

/// Acknowledgement properties carrying the interceptor's response (v5)
fn ack_properties(client: &Connected, result: &mut DispatchResult) -> Properties {
    let mut properties = Properties::default();
    if client.protocol_version.is_v5() {
        properties.reason_string = result.reason_string.take();
        properties.user_properties = std::mem::take(&mut result.user_properties);
    }
    properties
}

impl<T: Transport> Connection<T> {
    /// Handle PUBLISH packet
    pub(crate) async fn handle_publish(
        &mut self,
        client: &mut Connected,
        mut publish: Publish,
    ) -> Option<Close> {
        if publish.qos > self.config.max_qos {
            debug!(
                "PUBLISH from {} with QoS {:?} above maximum {:?}",
                client.client_id, publish.qos, self.config.max_qos
            );
            return Some(Close::Rejected(ReasonCode::QoSNotSupported));
        }
        if publish.retain && !self.config.retain_available {
            return Some(Close::Rejected(ReasonCode::RetainNotSupported));
        }
        if publish.qos > QoS::AtMostOnce && publish.packet_id.is_none() {
            return Some(Close::Protocol(ProtocolError::ProtocolViolation(
                "QoS > 0 PUBLISH without packet identifier",
            )));
        }

        if let Err(e) = client.resolve_topic_alias(&mut publish, self.config.max_topic_alias) {
            return Some(Close::Protocol(e));
        }
        if let Err(e) = validate_topic_name(&publish.topic) {
            debug!("Invalid topic name {:?} from {}: {}", publish.topic, client.client_id, e);
            return Some(Close::Protocol(ProtocolError::InvalidTopic(e)));
        }

        trace!(
            "PUBLISH from {} to {} (QoS {:?})",
            client.client_id,
            publish.topic,
            publish.qos
        );

        match (publish.qos, publish.packet_id) {
            (QoS::AtLeastOnce, Some(packet_id)) => {
                let mut result = self.dispatch(client, &publish).await;
                if result.close_connection {
                    return Some(Close::rejected(result.reason_code));
                }
                let mut puback = PubAck::with_reason(packet_id, result.reason_code);
                puback.properties = ack_properties(client, &mut result);
                client.send(Packet::PubAck(puback));
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                // Already received, waiting for PUBREL: acknowledge again
                // without routing a second copy
                if !client.session.write().incoming_qos2.insert(packet_id) {
                    trace!("Duplicate QoS 2 PUBLISH {} from {}", packet_id, client.client_id);
                    client.send(Packet::PubRec(PubRec::new(packet_id)));
                    return None;
                }

                let mut result = self.dispatch(client, &publish).await;
                if result.reason_code.is_error() {
                    client.session.write().incoming_qos2.remove(&packet_id);
                }
                if result.close_connection {
                    return Some(Close::rejected(result.reason_code));
                }
                let mut pubrec = PubRec::with_reason(packet_id, result.reason_code);
                pubrec.properties = ack_properties(client, &mut result);
                client.send(Packet::PubRec(pubrec));
            }
            _ => {
                let result = self.dispatch(client, &publish).await;
                if result.close_connection {
                    return Some(Close::rejected(result.reason_code));
                }
            }
        }
        None
    }

    /// Handle PUBREL packet (QoS 2 inbound, final step)
    pub(crate) fn handle_pubrel(&mut self, client: &mut Connected, pubrel: PubRel) {
        let known = client
            .session
            .write()
            .incoming_qos2
            .remove(&pubrel.packet_id);
        let reason_code = if known {
            ReasonCode::Success
        } else {
            debug!("PUBREL for unknown packet {} from {}", pubrel.packet_id, client.client_id);
            ReasonCode::PacketIdentifierNotFound
        };
        client.send(Packet::PubComp(PubComp::with_reason(pubrel.packet_id, reason_code)));
    }

    async fn dispatch(&self, client: &Connected, publish: &Publish) -> DispatchResult {
        self.manager
            .dispatch_publish(
                ApplicationMessage::from(publish),
                Some(Arc::clone(&client.client_id)),
                Some(client.items.clone()),
            )
            .await
    }
}
