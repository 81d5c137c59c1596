//! Connection teardown

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Connected, Connection, ConnectionError};
use crate::broker::client::ServerClose;
use crate::broker::transport::{Transport, TransportError};
use crate::hooks::{ClientDisconnected, DisconnectType};
use crate::protocol::{Disconnect, Packet, ProtocolError, ReasonCode};

/// Why a connected client goes away
#[derive(Debug)]
pub(crate) enum Close {
    /// DISCONNECT from the client
    Client(ReasonCode),
    /// Takeover, management API or shutdown
    Server {
        reason_code: ReasonCode,
        cause: ServerClose,
    },
    /// Refused by configuration or an interceptor after CONNECT
    Rejected(ReasonCode),
    /// Closed without a response
    Protocol(ProtocolError),
    Transport(TransportError),
    KeepAlive,
    /// Outbound message never acknowledged
    RetriesExhausted(u16),
}

/// How a [`Close`] is carried out
struct Teardown {
    disconnect_type: DisconnectType,
    reason_code: ReasonCode,
    publish_will: bool,
    /// DISCONNECT sent to v5 clients before closing
    notify: Option<ReasonCode>,
    result: Result<(), ConnectionError>,
}

impl Close {
    /// Close requested by an interceptor. A success code is not a valid
    /// DISCONNECT reason here, so it becomes `UnspecifiedError`.
    pub(crate) fn rejected(reason_code: ReasonCode) -> Self {
        if reason_code.is_error() {
            Close::Rejected(reason_code)
        } else {
            Close::Rejected(ReasonCode::UnspecifiedError)
        }
    }

    fn teardown(self) -> Teardown {
        match self {
            Close::Client(reason_code) => Teardown {
                disconnect_type: DisconnectType::Clean,
                reason_code,
                publish_will: reason_code == ReasonCode::DisconnectWithWillMessage,
                notify: None,
                result: Ok(()),
            },
            Close::Server {
                reason_code,
                cause: ServerClose::Takeover,
            } => Teardown {
                disconnect_type: DisconnectType::Takeover,
                reason_code,
                publish_will: false,
                notify: Some(reason_code),
                result: Ok(()),
            },
            Close::Server {
                reason_code,
                cause: ServerClose::Administrative,
            } => Teardown {
                disconnect_type: DisconnectType::NotClean,
                reason_code,
                publish_will: true,
                notify: Some(reason_code),
                result: Ok(()),
            },
            Close::Server {
                reason_code,
                cause: ServerClose::Shutdown,
            } => Teardown {
                disconnect_type: DisconnectType::NotClean,
                reason_code,
                publish_will: true,
                notify: Some(reason_code),
                result: Err(ConnectionError::Shutdown),
            },
            Close::Rejected(reason_code) => Teardown {
                disconnect_type: DisconnectType::NotClean,
                reason_code,
                publish_will: true,
                notify: Some(reason_code),
                result: Err(ConnectionError::Rejected(reason_code)),
            },
            Close::Protocol(e) => Teardown {
                disconnect_type: DisconnectType::NotClean,
                reason_code: e.reason_code(),
                publish_will: true,
                notify: None,
                result: Err(ConnectionError::Protocol(e)),
            },
            Close::Transport(e) => Teardown {
                disconnect_type: DisconnectType::NotClean,
                reason_code: ReasonCode::UnspecifiedError,
                publish_will: true,
                notify: None,
                result: Err(ConnectionError::Transport(e)),
            },
            Close::KeepAlive => Teardown {
                disconnect_type: DisconnectType::NotClean,
                reason_code: ReasonCode::KeepAliveTimeout,
                publish_will: true,
                notify: Some(ReasonCode::KeepAliveTimeout),
                result: Err(ConnectionError::Timeout),
            },
            Close::RetriesExhausted(_) => Teardown {
                disconnect_type: DisconnectType::NotClean,
                reason_code: ReasonCode::UnspecifiedError,
                publish_will: true,
                notify: None,
                result: Err(ConnectionError::Timeout),
            },
        }
    }
}

impl<T: Transport> Connection<T> {
    /// DISCONNECT from the client
    pub(crate) fn handle_client_disconnect(
        &mut self,
        client: &mut Connected,
        disconnect: Disconnect,
    ) -> Option<Close> {
        debug!(
            "DISCONNECT from {} (reason: {})",
            client.client_id, disconnect.reason_code
        );

        // v5 may update the session expiry, but not from zero
        if let Some(expiry) = disconnect.properties.session_expiry_interval {
            let mut s = client.session.write();
            if s.expiry_interval == 0 && expiry > 0 {
                return Some(Close::Protocol(ProtocolError::ProtocolViolation(
                    "session expiry set on DISCONNECT after CONNECT with zero",
                )));
            }
            s.expiry_interval = expiry;
            s.is_persistent = self.config.persistent_sessions && expiry > 0;
        }
        Some(Close::Client(disconnect.reason_code))
    }

    /// Tear the connection down: notify the client if appropriate, stop the
    /// writer, detach the session and fire `ClientDisconnected`.
    pub(crate) async fn close(
        &mut self,
        client: Connected,
        close: Close,
        outbound: Option<JoinHandle<()>>,
    ) -> Result<(), ConnectionError> {
        match &close {
            Close::Client(_) | Close::Server { .. } => {
                debug!("Client {} disconnected", client.client_id)
            }
            Close::KeepAlive => info!("Keep alive timeout for {} - disconnecting", client.client_id),
            Close::RetriesExhausted(packet_id) => warn!(
                "No acknowledgement from {} for packet {} - disconnecting",
                client.client_id, packet_id
            ),
            other => debug!("Closing {}: {:?}", client.client_id, other),
        }

        let teardown = close.teardown();
        if let Some(reason_code) = teardown.notify {
            if client.protocol_version.is_v5() {
                client.send(Packet::Disconnect(Disconnect::new(reason_code)));
            }
        }
        client.writer.close();

        if let Some(mut task) = outbound {
            let timeout = self.config.communication_timeout;
            if tokio::time::timeout(timeout, &mut task).await.is_err() {
                debug!("Writer of {} did not finish in time, aborting", client.client_id);
                task.abort();
            }
        }

        self.manager
            .detach(&client.handle, &client.session, teardown.publish_will)
            .await;

        self.manager
            .events()
            .client_disconnected(ClientDisconnected {
                client_id: client.client_id.clone(),
                endpoint: self.endpoint.clone(),
                disconnect_type: teardown.disconnect_type,
                reason_code: teardown.reason_code,
                session_items: client.items.clone(),
            })
            .await;

        client.control.mark_closed();
        teardown.result
    }
}
