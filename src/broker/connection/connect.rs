//! CONNECT packet handling

use std::sync::Arc;

use ahash::AHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, error, Instrument};

use super::{outbound, rand_id, Connected, Connection, ConnectionError};
use crate::broker::client::ClientInfo;
use crate::broker::keepalive::KeepAlive;
use crate::broker::sessions::SessionRequest;
use crate::broker::transport::{PacketReader, PacketWriter, Transport, TransportError};
use crate::broker::writer::SharedWriter;
use crate::hooks::{ClientConnected, HookError, ValidatingConnection};
use crate::protocol::{
    ApplicationMessage, ConnAck, Connect, Packet, Properties, ProtocolError, ProtocolVersion, QoS,
    ReasonCode,
};
use crate::session::{SessionItems, SESSION_NEVER_EXPIRES};
use crate::topic::validate_topic_name;

impl<T: Transport> Connection<T> {
    /// Wait for CONNECT within the communication timeout and process it
    pub(crate) async fn read_connect(
        &mut self,
    ) -> Result<(Connected, JoinHandle<()>), ConnectionError> {
        let timeout = self.config.communication_timeout;
        let result = tokio::select! {
            result = tokio::time::timeout(timeout, self.reader.read_packet()) => result,
            _ = self.shutdown.recv() => {
                self.close_transport().await;
                return Err(ConnectionError::Shutdown);
            }
        };

        let connect = match result {
            Err(_) => {
                debug!("No CONNECT from {} within {:?}", self.endpoint, timeout);
                self.close_transport().await;
                return Err(ConnectionError::Timeout);
            }
            Ok(Ok(Packet::Connect(connect))) => *connect,
            Ok(Ok(other)) => {
                // Protocol violation - first packet must be CONNECT
                debug!("First packet from {} was {}, not CONNECT", self.endpoint, other.name());
                self.close_transport().await;
                return Err(ProtocolError::UnexpectedPacket(other.name()).into());
            }
            Ok(Err(TransportError::Malformed(reason))) => {
                debug!("Malformed CONNECT from {}: {}", self.endpoint, reason);
                self.close_transport().await;
                return Err(ProtocolError::MalformedPacket(reason).into());
            }
            Ok(Err(e)) => {
                self.close_transport().await;
                return Err(e.into());
            }
        };

        self.handle_connect(connect).await
    }

    async fn handle_connect(
        &mut self,
        connect: Connect,
    ) -> Result<(Connected, JoinHandle<()>), ConnectionError> {
        let version = connect.protocol_version;
        self.reader.set_protocol_version(version);
        if let Some(writer) = self.writer.as_mut() {
            writer.set_protocol_version(version);
        }

        debug!(
            "CONNECT from {} (client_id: {:?}, version: {:?})",
            self.endpoint, connect.client_id, version
        );

        let will = match &connect.will {
            Some(will) => {
                if let Err(e) = validate_topic_name(&will.topic) {
                    debug!("Invalid will topic from {}: {}", self.endpoint, e);
                    self.close_transport().await;
                    return Err(ProtocolError::InvalidTopic(e).into());
                }
                Some(ApplicationMessage::from(will))
            }
            None => None,
        };
        let will_delay_interval = connect
            .will
            .as_ref()
            .and_then(|w| w.properties.will_delay_interval)
            .unwrap_or(0);

        let session_expiry_interval = if version.is_v5() {
            connect.properties.session_expiry_interval.unwrap_or(0)
        } else if connect.clean_start {
            0
        } else {
            SESSION_NEVER_EXPIRES
        };

        let (keep_alive, server_keep_alive) = self.negotiate_keep_alive(version, connect.keep_alive);

        let mut ctx = ValidatingConnection {
            client_id: connect.client_id.clone(),
            username: connect.username.clone(),
            password: connect.password.clone(),
            endpoint: self.endpoint.clone(),
            protocol_version: version,
            clean_start: connect.clean_start,
            session_expiry_interval,
            keep_alive,
            user_properties: connect.properties.user_properties.clone(),
            session_items: Arc::new(SessionItems::new()),
            reason_code: ReasonCode::Success,
            assigned_client_identifier: None,
            server_reference: None,
            reason_string: None,
            response_user_properties: Vec::new(),
        };
        match self.manager.events().hooks().validate_connection(&mut ctx).await {
            Ok(()) => {}
            Err(HookError::Denied(reason_code)) => ctx.reason_code = reason_code,
            Err(e) => {
                error!("Connection validation error for {}: {}", self.endpoint, e);
                ctx.reason_code = ReasonCode::UnspecifiedError;
            }
        }

        if !ctx.is_accepted() {
            let mut properties = Properties::default();
            if version.is_v5() {
                properties.server_reference = ctx.server_reference.take();
                properties.reason_string = ctx.reason_string.take();
                properties.user_properties = std::mem::take(&mut ctx.response_user_properties);
            }
            return Err(self.reject(ctx.reason_code, properties).await);
        }

        // Per MQTT-3.1.3-8: an empty client id needs clean start, unless the
        // validation hook assigned one
        let (client_id, assigned): (Arc<str>, Option<String>) = if !connect.client_id.is_empty() {
            (Arc::from(connect.client_id.as_str()), None)
        } else if let Some(assigned) = ctx.assigned_client_identifier.take() {
            (Arc::from(assigned.as_str()), Some(assigned))
        } else if connect.clean_start {
            let generated = format!("auto-{:016x}", rand_id());
            (Arc::from(generated.as_str()), Some(generated))
        } else {
            debug!("Rejecting empty client ID without clean start from {}", self.endpoint);
            return Err(self
                .reject(ReasonCode::ClientIdentifierNotValid, Properties::default())
                .await);
        };
        tracing::Span::current().record("client_id", &*client_id);

        let Some(mut transport) = self.writer.take() else {
            return Err(TransportError::Closed.into());
        };

        let items = ctx.session_items.clone();
        let attached = self
            .manager
            .attach(
                SessionRequest {
                    clean_start: connect.clean_start,
                    session_expiry_interval,
                    will,
                    will_delay_interval,
                    items: items.clone(),
                },
                ClientInfo {
                    client_id: client_id.clone(),
                    endpoint: self.endpoint.clone(),
                    protocol_version: version,
                    username: connect.username.clone(),
                    keep_alive,
                },
            )
            .await;
        let attached = match attached {
            Ok(attached) => attached,
            Err(e) => {
                debug!("Refusing {} from {}: {}", client_id, self.endpoint, e);
                self.writer = Some(transport);
                let reason_code = if version.is_v5() {
                    ReasonCode::ServerShuttingDown
                } else {
                    ReasonCode::ServerUnavailable
                };
                self.reject(reason_code, Properties::default()).await;
                return Err(ConnectionError::Shutdown);
            }
        };

        let mut properties = Properties::default();
        if version.is_v5() {
            properties.assigned_client_identifier = assigned;
            properties.server_keep_alive = server_keep_alive;
            if !self.config.persistent_sessions && session_expiry_interval > 0 {
                properties.session_expiry_interval = Some(0);
            }
            properties.retain_available = Some(self.config.retain_available);
            properties.wildcard_subscription_available = Some(self.config.wildcard_subscriptions);
            properties.subscription_identifiers_available =
                Some(self.config.subscription_identifiers);
            properties.shared_subscription_available = Some(false);
            properties.topic_alias_maximum =
                (self.config.max_topic_alias > 0).then_some(self.config.max_topic_alias);
            properties.maximum_qos =
                (self.config.max_qos < QoS::ExactlyOnce).then_some(self.config.max_qos as u8);
            properties.reason_string = ctx.reason_string.take();
            properties.user_properties = std::mem::take(&mut ctx.response_user_properties);
        }
        let connack = ConnAck {
            session_present: attached.session_present,
            reason_code: ReasonCode::Success,
            properties,
        };

        if let Err(e) = transport.write_packet(Packet::ConnAck(connack)).await {
            debug!("Failed to send CONNACK to {}: {}", client_id, e);
            self.manager
                .detach(&attached.handle, &attached.session, false)
                .await;
            attached.control.mark_closed();
            let _ = transport.close().await;
            return Err(e.into());
        }

        let writer = Arc::new(SharedWriter::new(version));
        let (notify, resend) = {
            let mut s = attached.session.write();
            (s.notifier(), s.resume_packets())
        };
        if !resend.is_empty() {
            debug!("Resending {} PUBREL packets to {}", resend.len(), client_id);
            let _ = writer.send_all(resend);
        }

        let max_inflight = self.max_inflight(connect.properties.receive_maximum);
        let outbound = tokio::spawn(
            outbound::run(
                transport,
                writer.clone(),
                attached.session.clone(),
                notify.clone(),
                self.manager.events().hooks().clone(),
                client_id.clone(),
                max_inflight,
            )
            .in_current_span(),
        );

        debug!(
            "Client {} connected from {} (session present: {}, keep alive: {}s)",
            client_id, self.endpoint, attached.session_present, keep_alive
        );
        self.manager
            .events()
            .client_connected(ClientConnected {
                client_id: client_id.clone(),
                username: connect.username,
                endpoint: self.endpoint.clone(),
                protocol_version: version,
                session_items: items.clone(),
            })
            .await;

        let client = Connected {
            client_id,
            protocol_version: version,
            session: attached.session,
            handle: attached.handle,
            control: attached.control,
            writer,
            notify,
            items,
            keep_alive: KeepAlive::new(keep_alive),
            topic_aliases: AHashMap::new(),
        };
        Ok((client, outbound))
    }

    /// Keep-alive to enforce, and the value to announce in CONNACK (v5)
    fn negotiate_keep_alive(&self, version: ProtocolVersion, requested: u16) -> (u16, Option<u16>) {
        if !version.is_v5() {
            return (requested, None);
        }
        if requested == 0 && self.config.default_keep_alive > 0 {
            let keep_alive = self.config.default_keep_alive;
            return (keep_alive, Some(keep_alive));
        }
        if requested > self.config.max_keep_alive {
            let keep_alive = self.config.max_keep_alive;
            return (keep_alive, Some(keep_alive));
        }
        (requested, None)
    }

    /// Send quota: the client's receive maximum, capped by configuration
    fn max_inflight(&self, receive_maximum: Option<u16>) -> usize {
        let receive_maximum = usize::from(receive_maximum.unwrap_or(u16::MAX));
        match self.config.max_inflight {
            0 => receive_maximum,
            limit => limit.min(receive_maximum),
        }
    }

    /// Refuse the connection with a CONNACK carrying `reason_code`
    async fn reject(&mut self, reason_code: ReasonCode, properties: Properties) -> ConnectionError {
        debug!(
            "Connection from {} rejected: {} (v3 return code {})",
            self.endpoint,
            reason_code,
            reason_code.to_v3_connack_code()
        );
        if let Some(writer) = self.writer.as_mut() {
            let connack = ConnAck {
                session_present: false,
                reason_code,
                properties,
            };
            if let Err(e) = writer.write_packet(Packet::ConnAck(connack)).await {
                debug!("Failed to send CONNACK to {}: {}", self.endpoint, e);
            }
        }
        self.close_transport().await;
        ConnectionError::Rejected(reason_code)
    }

    /// Close the transport before a session was attached
    async fn close_transport(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.close().await;
        }
    }
}
