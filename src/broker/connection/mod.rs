//! MQTT Connection Handler
//!
//! One task per connection reads packets and drives the protocol state
//! machine. A second task owns the transport's write half and drains the
//! control queue and the session's pending queue, so a slow reader on the
//! client side never blocks inbound processing.

mod connect;
mod disconnect;
mod outbound;
mod publish;
mod qos;
mod subscribe;

use std::sync::Arc;

use ahash::AHashMap;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::client::{ClientControl, ClientHandle, ConnectionCommand};
use super::keepalive::KeepAlive;
use super::sessions::{SessionsManager, SharedSession};
use super::transport::{PacketReader, Transport, TransportError};
use super::writer::SharedWriter;
use super::BrokerConfig;
use crate::protocol::{Packet, ProtocolError, ProtocolVersion, ReasonCode};
use crate::session::SessionItems;

pub(crate) use disconnect::Close;

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Transport(TransportError),
    Protocol(ProtocolError),
    /// No CONNECT in time, keep-alive expired or retries exhausted
    Timeout,
    /// CONNECT refused or connection closed with this reason code
    Rejected(ReasonCode),
    Shutdown,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Transport(e) => write!(f, "Transport error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::Rejected(rc) => write!(f, "Rejected: {}", rc),
            ConnectionError::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectionError::Transport(e) => Some(e),
            ConnectionError::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for ConnectionError {
    fn from(e: TransportError) -> Self {
        ConnectionError::Transport(e)
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(e: ProtocolError) -> Self {
        ConnectionError::Protocol(e)
    }
}

/// State of a connection once CONNECT was accepted
pub(crate) struct Connected {
    pub client_id: Arc<str>,
    pub protocol_version: ProtocolVersion,
    pub session: SharedSession,
    pub handle: Arc<ClientHandle>,
    pub control: ClientControl,
    pub writer: Arc<SharedWriter>,
    /// Wakes the outbound task when in-flight slots free up
    pub notify: Arc<Notify>,
    pub items: Arc<SessionItems>,
    pub keep_alive: KeepAlive,
    /// Inbound topic aliases (v5)
    pub topic_aliases: AHashMap<u16, Arc<str>>,
}

impl Connected {
    /// Queue a packet for the outbound task. A closed writer means the
    /// connection is already going down, so the packet is dropped.
    pub fn send(&self, packet: Packet) {
        if self.writer.send_packet(packet).is_err() {
            trace!("Writer closed, dropping packet for {}", self.client_id);
        }
    }
}

/// Connection handler, generic over the transport
pub struct Connection<T: Transport> {
    pub(crate) reader: T::Reader,
    pub(crate) writer: Option<T::Writer>,
    pub(crate) endpoint: String,
    pub(crate) manager: Arc<SessionsManager>,
    pub(crate) config: Arc<BrokerConfig>,
    pub(crate) shutdown: broadcast::Receiver<()>,
}

impl<T: Transport> Connection<T> {
    pub(crate) fn new(
        transport: T,
        manager: Arc<SessionsManager>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let endpoint = transport.endpoint();
        let (reader, writer) = transport.split();
        Self {
            reader,
            writer: Some(writer),
            endpoint,
            config: manager.config().clone(),
            manager,
            shutdown,
        }
    }

    /// Run the connection until it closes
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        let (mut client, outbound) = self.read_connect().await?;
        let mut outbound = Some(outbound);
        let close = self.run_connected(&mut client, &mut outbound).await;
        self.close(client, close, outbound).await
    }

    /// Main loop, returns why the connection ends
    async fn run_connected(
        &mut self,
        client: &mut Connected,
        outbound: &mut Option<JoinHandle<()>>,
    ) -> Close {
        let timeout = self.config.communication_timeout;
        let mut retry_ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + timeout, timeout);

        loop {
            tokio::select! {
                command = client.control.commands.recv() => {
                    match command {
                        Some(ConnectionCommand::Disconnect { reason_code, cause }) => {
                            debug!("Closing {} ({:?}, reason: {})", client.client_id, cause, reason_code);
                            return Close::Server { reason_code, cause };
                        }
                        None => return Close::Transport(TransportError::Closed),
                    }
                }

                result = self.reader.read_packet() => {
                    match result {
                        Ok(packet) => {
                            client.keep_alive.reset();
                            trace!("{} from {}", packet.name(), client.client_id);
                            if let Some(close) = self.handle_packet(client, packet).await {
                                return close;
                            }
                        }
                        Err(TransportError::Malformed(reason)) => {
                            return Close::Protocol(ProtocolError::MalformedPacket(reason));
                        }
                        Err(e) => return Close::Transport(e),
                    }
                }

                _ = retry_ticker.tick() => {
                    if let Some(close) = self.retry_inflight(client) {
                        return close;
                    }
                }

                _ = client.keep_alive.expired() => {
                    return Close::KeepAlive;
                }

                _ = async {
                    match outbound.as_mut() {
                        Some(task) => {
                            let _ = task.await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    // the writer task only ends early on a transport error
                    *outbound = None;
                    return Close::Transport(TransportError::Closed);
                }
            }
        }
    }

    /// Handle an incoming packet. `Some` ends the connection.
    async fn handle_packet(&mut self, client: &mut Connected, packet: Packet) -> Option<Close> {
        match packet {
            Packet::Publish(publish) => self.handle_publish(client, publish).await,
            Packet::PubAck(puback) => {
                self.handle_puback(client, puback).await;
                None
            }
            Packet::PubRec(pubrec) => {
                self.handle_pubrec(client, pubrec);
                None
            }
            Packet::PubRel(pubrel) => {
                self.handle_pubrel(client, pubrel);
                None
            }
            Packet::PubComp(pubcomp) => {
                self.handle_pubcomp(client, pubcomp).await;
                None
            }
            Packet::Subscribe(subscribe) => self.handle_subscribe(client, subscribe).await,
            Packet::Unsubscribe(unsubscribe) => self.handle_unsubscribe(client, unsubscribe).await,
            Packet::PingReq => {
                client.send(Packet::PingResp);
                None
            }
            Packet::Disconnect(disconnect) => self.handle_client_disconnect(client, disconnect),
            Packet::Connect(_)
            | Packet::ConnAck(_)
            | Packet::SubAck(_)
            | Packet::UnsubAck(_)
            | Packet::PingResp => Some(Close::Protocol(ProtocolError::UnexpectedPacket(
                packet.name(),
            ))),
        }
    }
}

/// Generate a random ID
pub(crate) fn rand_id() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish()
}
