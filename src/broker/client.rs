//! Handles to live connections
//!
//! The sessions manager keeps one [`ClientHandle`] per connected client id.
//! It is the only way to reach a connection task from outside: a command
//! channel to ask it to close, and a watch flag that flips once its cleanup
//! (session detach, will, events) is complete.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, watch};

use crate::protocol::{ProtocolVersion, ReasonCode};

/// Why the server closes a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServerClose {
    /// A newer connection took over the client id
    Takeover,
    /// Management API
    Administrative,
    /// Broker shutdown
    Shutdown,
}

#[derive(Debug)]
pub(crate) enum ConnectionCommand {
    Disconnect {
        reason_code: ReasonCode,
        cause: ServerClose,
    },
}

#[derive(Debug)]
pub(crate) struct ClientHandle {
    pub client_id: Arc<str>,
    pub endpoint: String,
    pub protocol_version: ProtocolVersion,
    pub username: Option<String>,
    pub connected_at: SystemTime,
    pub keep_alive: u16,
    /// Session generation this connection attached as
    pub generation: u64,
    commands: mpsc::UnboundedSender<ConnectionCommand>,
    closed: watch::Receiver<bool>,
}

/// Connection side of a [`ClientHandle`]
pub(crate) struct ClientControl {
    pub commands: mpsc::UnboundedReceiver<ConnectionCommand>,
    closed: watch::Sender<bool>,
}

impl ClientControl {
    /// Cleanup done, wake everyone waiting on the handle
    pub fn mark_closed(&self) {
        self.closed.send_replace(true);
    }
}

pub(crate) struct ClientInfo {
    pub client_id: Arc<str>,
    pub endpoint: String,
    pub protocol_version: ProtocolVersion,
    pub username: Option<String>,
    pub keep_alive: u16,
}

impl ClientHandle {
    pub fn new(info: ClientInfo, generation: u64) -> (ClientHandle, ClientControl) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let handle = ClientHandle {
            client_id: info.client_id,
            endpoint: info.endpoint,
            protocol_version: info.protocol_version,
            username: info.username,
            connected_at: SystemTime::now(),
            keep_alive: info.keep_alive,
            generation,
            commands: cmd_tx,
            closed: closed_rx,
        };
        let control = ClientControl {
            commands: cmd_rx,
            closed: closed_tx,
        };
        (handle, control)
    }

    /// Ask the connection to close. Returns false if it is already gone.
    pub fn request_disconnect(&self, reason_code: ReasonCode, cause: ServerClose) -> bool {
        self.commands
            .send(ConnectionCommand::Disconnect { reason_code, cause })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait for the connection cleanup to finish. Returns false on timeout.
    pub async fn wait_closed(&self, timeout: Duration) -> bool {
        let mut closed = self.closed.clone();
        let waited = tokio::time::timeout(timeout, async {
            // sender dropped: the task is gone, which counts as closed
            let _ = closed.wait_for(|done| *done).await;
        })
        .await;
        waited.is_ok()
    }
}

/// Read-only view of a live connection, with the ability to close it
#[derive(Clone)]
pub struct ClientStatus {
    handle: Arc<ClientHandle>,
    timeout: Duration,
}

impl ClientStatus {
    pub(crate) fn new(handle: Arc<ClientHandle>, timeout: Duration) -> Self {
        Self { handle, timeout }
    }

    pub fn client_id(&self) -> &str {
        &self.handle.client_id
    }

    pub fn endpoint(&self) -> &str {
        &self.handle.endpoint
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.handle.protocol_version
    }

    pub fn username(&self) -> Option<&str> {
        self.handle.username.as_deref()
    }

    pub fn connected_at(&self) -> SystemTime {
        self.handle.connected_at
    }

    pub fn keep_alive(&self) -> u16 {
        self.handle.keep_alive
    }

    pub fn is_connected(&self) -> bool {
        !self.handle.is_closed()
    }

    /// Close the connection with `reason_code` (sent as DISCONNECT to v5
    /// clients) and wait until it is gone. The will message is published.
    pub async fn disconnect(&self, reason_code: ReasonCode) -> bool {
        if !self
            .handle
            .request_disconnect(reason_code, ServerClose::Administrative)
        {
            return self.handle.is_closed();
        }
        self.handle.wait_closed(self.timeout).await
    }
}

impl std::fmt::Debug for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStatus")
            .field("client_id", &self.handle.client_id)
            .field("endpoint", &self.handle.endpoint)
            .field("protocol_version", &self.handle.protocol_version)
            .finish()
    }
}
