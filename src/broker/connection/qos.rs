//! Outbound QoS 1/2 acknowledgements and retransmission

use tracing::{debug, trace};

use super::{Close, Connected, Connection};
use crate::broker::transport::Transport;
use crate::hooks::ClientAcknowledged;
use crate::protocol::{Packet, PubAck, PubComp, PubRec, PubRel, ReasonCode};
use crate::session::{InflightMessage, RetryOutcome};

impl<T: Transport> Connection<T> {
    /// Handle PUBACK packet (QoS 1 outbound complete)
    pub(crate) async fn handle_puback(&mut self, client: &mut Connected, puback: PubAck) {
        let completed = client.session.write().complete_puback(puback.packet_id);
        match completed {
            Some(message) => self.acknowledged(client, message).await,
            None => trace!("PUBACK for unknown packet {} from {}", puback.packet_id, client.client_id),
        }
    }

    /// Handle PUBREC packet (QoS 2 outbound, first step)
    pub(crate) fn handle_pubrec(&mut self, client: &mut Connected, pubrec: PubRec) {
        let packet_id = pubrec.packet_id;
        if pubrec.reason_code.is_error() {
            // the receiver refused the message, the exchange ends here
            debug!(
                "PUBREC {} from {} with {}",
                packet_id, client.client_id, pubrec.reason_code
            );
            if client.session.write().inflight.remove(&packet_id).is_some() {
                client.notify.notify_one();
            }
            return;
        }

        let known = client.session.write().complete_pubrec(packet_id);
        let pubrel = if known {
            PubRel::new(packet_id)
        } else {
            PubRel::with_reason(packet_id, ReasonCode::PacketIdentifierNotFound)
        };
        client.send(Packet::PubRel(pubrel));
    }

    /// Handle PUBCOMP packet (QoS 2 outbound complete)
    pub(crate) async fn handle_pubcomp(&mut self, client: &mut Connected, pubcomp: PubComp) {
        let completed = client.session.write().complete_pubcomp(pubcomp.packet_id);
        match completed {
            Some(message) => self.acknowledged(client, message).await,
            None => trace!(
                "PUBCOMP for unknown packet {} from {}",
                pubcomp.packet_id,
                client.client_id
            ),
        }
    }

    async fn acknowledged(&self, client: &Connected, message: InflightMessage) {
        // an in-flight slot is free again
        client.notify.notify_one();
        self.manager
            .events()
            .client_acknowledged(ClientAcknowledged {
                client_id: client.client_id.clone(),
                packet_id: message.packet_id,
                qos: message.publish.qos,
                topic: message.publish.topic,
                is_completed: true,
            })
            .await;
    }

    /// Resend in-flight messages past the communication timeout. Gives up
    /// on the connection once a message ran out of retries.
    pub(crate) fn retry_inflight(&mut self, client: &mut Connected) -> Option<Close> {
        let outcome = client
            .session
            .write()
            .due_for_retry(self.config.communication_timeout, self.config.max_retries);
        match outcome {
            RetryOutcome::Resend(packets) if packets.is_empty() => None,
            RetryOutcome::Resend(packets) => {
                debug!("Resending {} packets to {}", packets.len(), client.client_id);
                let _ = client.writer.send_all(packets);
                None
            }
            RetryOutcome::Exhausted(packet_id) => Some(Close::RetriesExhausted(packet_id)),
        }
    }
}
