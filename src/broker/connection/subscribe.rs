//! SUBSCRIBE and UNSUBSCRIBE handling

use tracing::{debug, trace};

use super::{Close, Connected, Connection};
use crate::broker::transport::Transport;
use crate::protocol::{
    Packet, Properties, ProtocolError, SubAck, Subscribe, UnsubAck, Unsubscribe,
};

impl<T: Transport> Connection<T> {
    /// Handle SUBSCRIBE packet. SUBACK is queued before any retained
    /// message the new subscriptions replay.
    pub(crate) async fn handle_subscribe(
        &mut self,
        client: &mut Connected,
        subscribe: Subscribe,
    ) -> Option<Close> {
        if subscribe.subscriptions.is_empty() {
            return Some(Close::Protocol(ProtocolError::ProtocolViolation(
                "SUBSCRIBE without topic filters",
            )));
        }

        let identifier = subscribe.properties.subscription_identifier();
        let mut reason_codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut retained = Vec::new();

        for subscription in &subscribe.subscriptions {
            let outcome = self
                .manager
                .subscribe(
                    &client.session,
                    &subscription.filter,
                    subscription.options,
                    identifier,
                )
                .await;
            if outcome.close_connection {
                debug!(
                    "Subscription to {} by {} closes the connection",
                    subscription.filter, client.client_id
                );
                return Some(Close::rejected(outcome.reason_code));
            }
            trace!(
                "SUBSCRIBE {} from {}: {}",
                subscription.filter,
                client.client_id,
                outcome.reason_code
            );
            reason_codes.push(outcome.reason_code);
            retained.extend(outcome.retained);
        }

        client.send(Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            reason_codes,
            properties: Properties::default(),
        }));

        for publish in retained {
            if let Err(e) = self
                .manager
                .enqueue_publish(&client.session, &client.client_id, None, publish, None)
                .await
            {
                debug!("Retained message not queued for {}: {}", client.client_id, e);
            }
        }
        None
    }

    /// Handle UNSUBSCRIBE packet
    pub(crate) async fn handle_unsubscribe(
        &mut self,
        client: &mut Connected,
        unsubscribe: Unsubscribe,
    ) -> Option<Close> {
        if unsubscribe.filters.is_empty() {
            return Some(Close::Protocol(ProtocolError::ProtocolViolation(
                "UNSUBSCRIBE without topic filters",
            )));
        }

        let mut reason_codes = Vec::with_capacity(unsubscribe.filters.len());
        for filter in &unsubscribe.filters {
            let (reason_code, close_connection) =
                self.manager.unsubscribe(&client.session, filter).await;
            if close_connection {
                return Some(Close::rejected(reason_code));
            }
            reason_codes.push(reason_code);
        }

        client.send(Packet::UnsubAck(UnsubAck {
            packet_id: unsubscribe.packet_id,
            reason_codes,
            properties: Properties::default(),
        }));
        None
    }
}
