//! Outbound control queue shared between a connection and its writer task.
//!
//! The reading side of a connection never writes to the transport itself:
//! acks, PINGRESP, SUBACK and retransmissions are pushed here and picked up
//! by the writer task ahead of queued application messages, so a slow peer
//! on the outbound direction never stalls packet processing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::protocol::{Packet, ProtocolVersion};

/// Error when sending to a SharedWriter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Connection is closed
    Closed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connection writer is closed")
    }
}

impl std::error::Error for SendError {}

pub struct SharedWriter {
    /// Control packets waiting to be written
    control: Mutex<VecDeque<Packet>>,
    /// Notification when the control queue has new data or the writer closed
    notify: Notify,
    /// Protocol version, for logs and the outbound interceptor
    protocol_version: ProtocolVersion,
    /// Whether the connection is still alive
    alive: AtomicBool,
}

impl SharedWriter {
    pub fn new(protocol_version: ProtocolVersion) -> Self {
        Self {
            control: Mutex::new(VecDeque::with_capacity(16)),
            notify: Notify::new(),
            protocol_version,
            alive: AtomicBool::new(true),
        }
    }

    /// Check if the connection is still alive
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    /// Stop accepting packets. Whatever is already queued is still written.
    pub fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    /// Get the notify handle for the writer loop
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Queue a control packet (acks, PINGRESP, SUBACK, resends, DISCONNECT)
    pub fn send_packet(&self, packet: Packet) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }

        let was_empty = {
            let mut control = self.control.lock();
            let was_empty = control.is_empty();
            control.push_back(packet);
            was_empty
        };

        // Only notify if queue was empty - coalesces notifications during bursts
        if was_empty {
            self.notify.notify_one();
        }
        Ok(())
    }

    /// Queue several control packets in order
    pub fn send_all(&self, packets: impl IntoIterator<Item = Packet>) -> Result<(), SendError> {
        for packet in packets {
            self.send_packet(packet)?;
        }
        Ok(())
    }

    /// Take all pending control packets
    pub fn take_control(&self) -> VecDeque<Packet> {
        std::mem::take(&mut *self.control.lock())
    }

    /// Get queue length (for debugging)
    pub fn queued(&self) -> usize {
        self.control.lock().len()
    }
}

impl std::fmt::Debug for SharedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedWriter")
            .field("queued", &self.queued())
            .field("alive", &self.is_alive())
            .field("protocol_version", &self.protocol_version)
            .finish()
    }
}
