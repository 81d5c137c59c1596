//! Packet transport boundary
//!
//! The engine never sees bytes. A transport collaborator (TCP + codec,
//! WebSocket, an in-process channel) hands it decoded packets and writes
//! the packets it produces.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::{Packet, ProtocolVersion};

/// Errors reported by a transport
#[derive(Debug)]
pub enum TransportError {
    Io(io::Error),
    /// Bytes that do not decode into a packet
    Malformed(String),
    /// Peer went away
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "IO error: {}", e),
            TransportError::Malformed(msg) => write!(f, "malformed packet: {}", msg),
            TransportError::Closed => write!(f, "transport closed"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => TransportError::Closed,
            _ => TransportError::Io(e),
        }
    }
}

/// Inbound half of a transport
#[async_trait]
pub trait PacketReader: Send + Sync {
    /// Next decoded packet. Must be cancel safe: the connection polls it
    /// inside `select!` next to its timers.
    async fn read_packet(&mut self) -> Result<Packet, TransportError>;

    /// Called once CONNECT has fixed the protocol level
    fn set_protocol_version(&mut self, _version: ProtocolVersion) {}
}

/// Outbound half of a transport
#[async_trait]
pub trait PacketWriter: Send + Sync {
    async fn write_packet(&mut self, packet: Packet) -> Result<(), TransportError>;

    /// Flush and close the underlying connection
    async fn close(&mut self) -> Result<(), TransportError>;

    fn set_protocol_version(&mut self, _version: ProtocolVersion) {}
}

/// A connected client, ready to be split into its two halves
pub trait Transport: Send + 'static {
    type Reader: PacketReader + 'static;
    type Writer: PacketWriter + 'static;

    /// Remote endpoint, for logs and [`ClientStatus`](crate::broker::ClientStatus)
    fn endpoint(&self) -> String;

    fn split(self) -> (Self::Reader, Self::Writer);
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// In-process transport over two unbounded channels.
///
/// The broker gets the [`ChannelTransport`], the other side drives it
/// through a [`ChannelPeer`] as if it were a remote client.
pub struct ChannelTransport {
    endpoint: String,
    inbound: mpsc::UnboundedReceiver<Result<Packet, TransportError>>,
    outbound: mpsc::UnboundedSender<Packet>,
}

impl ChannelTransport {
    pub fn pair() -> (ChannelTransport, ChannelPeer) {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        Self::pair_with_endpoint(format!("memory:{}", id))
    }

    pub fn pair_with_endpoint(endpoint: impl Into<String>) -> (ChannelTransport, ChannelPeer) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let transport = ChannelTransport {
            endpoint: endpoint.into(),
            inbound: in_rx,
            outbound: out_tx,
        };
        let peer = ChannelPeer {
            tx: Some(in_tx),
            rx: out_rx,
        };
        (transport, peer)
    }
}

impl Transport for ChannelTransport {
    type Reader = ChannelReader;
    type Writer = ChannelWriter;

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn split(self) -> (ChannelReader, ChannelWriter) {
        (
            ChannelReader { rx: self.inbound },
            ChannelWriter {
                tx: Some(self.outbound),
            },
        )
    }
}

pub struct ChannelReader {
    rx: mpsc::UnboundedReceiver<Result<Packet, TransportError>>,
}

#[async_trait]
impl PacketReader for ChannelReader {
    async fn read_packet(&mut self) -> Result<Packet, TransportError> {
        match self.rx.recv().await {
            Some(result) => result,
            None => Err(TransportError::Closed),
        }
    }
}

pub struct ChannelWriter {
    tx: Option<mpsc::UnboundedSender<Packet>>,
}

#[async_trait]
impl PacketWriter for ChannelWriter {
    async fn write_packet(&mut self, packet: Packet) -> Result<(), TransportError> {
        match &self.tx {
            Some(tx) => tx.send(packet).map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

/// Client side of a [`ChannelTransport`]
pub struct ChannelPeer {
    tx: Option<mpsc::UnboundedSender<Result<Packet, TransportError>>>,
    rx: mpsc::UnboundedReceiver<Packet>,
}

impl ChannelPeer {
    /// Send a packet to the broker. Returns false once the broker side is gone.
    pub fn send(&self, packet: Packet) -> bool {
        match &self.tx {
            Some(tx) => tx.send(Ok(packet)).is_ok(),
            None => false,
        }
    }

    /// Simulate bytes the codec could not decode
    pub fn send_malformed(&self, reason: impl Into<String>) -> bool {
        match &self.tx {
            Some(tx) => tx.send(Err(TransportError::Malformed(reason.into()))).is_ok(),
            None => false,
        }
    }

    /// Next packet written by the broker, `None` once it closed the transport
    pub async fn recv(&mut self) -> Option<Packet> {
        self.rx.recv().await
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Packet> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Packet already written, without waiting
    pub fn try_recv(&mut self) -> Option<Packet> {
        self.rx.try_recv().ok()
    }

    /// Drop the client to broker direction, as a socket close would
    pub fn close(&mut self) {
        self.tx = None;
    }
}
