//! Client sessions
//!
//! A session is the durable per-client-id state: subscriptions, the pending
//! queue, QoS handshakes in progress and the will message. It outlives its
//! connection when persistent.

mod items;
mod packet_id;
mod queue;

pub use items::SessionItems;
pub use packet_id::PacketIdAllocator;
pub use queue::{
    DeliveryError, DeliveryResult, Enqueued, OverflowKind, OverflowStrategy, PendingMessage,
    PendingQueue,
};

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use ahash::{AHashMap, AHashSet};
use tokio::sync::{oneshot, Notify};

use crate::protocol::{ApplicationMessage, Packet, ProtocolVersion, PubRel, Publish, QoS};
use crate::topic::SubscriptionIndex;

/// Session expiry interval meaning "never expires"
pub const SESSION_NEVER_EXPIRES: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Attached to a live connection
    Connected,
    /// Detached, waiting for reconnection or expiry
    Disconnected,
    /// Removed from the sessions map; late deliveries are dropped
    Deleted,
}

/// QoS 2 outbound handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos2State {
    /// PUBLISH sent, waiting for PUBREC
    WaitingPubRec,
    /// PUBREL sent, waiting for PUBCOMP
    WaitingPubComp,
}

/// An outbound QoS 1/2 message waiting for its acknowledgement
#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub packet_id: u16,
    pub publish: Publish,
    pub qos2_state: Option<Qos2State>,
    pub sent_at: Instant,
    pub retry_count: u32,
    seq: u64,
}

/// A message taken off the pending queue, ready to be written
#[derive(Debug)]
pub struct Outgoing {
    pub publish: Publish,
    pub completion: Option<oneshot::Sender<DeliveryResult>>,
}

/// Packets due for retransmission, or the packet id whose retries ran out
#[derive(Debug)]
pub enum RetryOutcome {
    Resend(Vec<Packet>),
    Exhausted(u16),
}

pub struct Session {
    pub client_id: Arc<str>,
    pub protocol_version: ProtocolVersion,
    pub state: SessionState,
    pub items: Arc<SessionItems>,
    pub subscriptions: SubscriptionIndex,
    pub pending: PendingQueue,
    pub inflight: AHashMap<u16, InflightMessage>,
    /// Inbound QoS 2 packet ids between PUBLISH and PUBREL
    pub incoming_qos2: AHashSet<u16>,
    pub will: Option<ApplicationMessage>,
    pub will_delay_interval: u32,
    /// Seconds (0 = end with the connection, `u32::MAX` = never)
    pub expiry_interval: u32,
    pub is_persistent: bool,
    pub created_at: SystemTime,
    /// Wall clock, so a restored snapshot keeps its expiry deadline
    pub disconnected_at: Option<SystemTime>,
    /// Bumped every time a connection attaches
    pub generation: u64,
    packet_ids: PacketIdAllocator,
    /// Ids carried by requeued messages
    reserved_ids: AHashSet<u16>,
    send_seq: u64,
    notify: Arc<Notify>,
}

impl Session {
    pub fn new(
        client_id: Arc<str>,
        protocol_version: ProtocolVersion,
        max_pending: usize,
        overflow: OverflowStrategy,
    ) -> Self {
        Self {
            subscriptions: SubscriptionIndex::new(client_id.clone()),
            client_id,
            protocol_version,
            state: SessionState::Disconnected,
            items: Arc::new(SessionItems::new()),
            pending: PendingQueue::new(max_pending, overflow),
            inflight: AHashMap::new(),
            incoming_qos2: AHashSet::new(),
            will: None,
            will_delay_interval: 0,
            expiry_interval: 0,
            is_persistent: false,
            created_at: SystemTime::now(),
            disconnected_at: None,
            generation: 0,
            packet_ids: PacketIdAllocator::new(),
            reserved_ids: AHashSet::new(),
            send_seq: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Signal used to wake the delivery loop of the attached connection
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn mark_connected(&mut self) {
        self.state = SessionState::Connected;
        self.disconnected_at = None;
        self.generation += 1;
    }

    pub fn mark_disconnected(&mut self) {
        if self.state != SessionState::Deleted {
            self.state = SessionState::Disconnected;
        }
        self.disconnected_at = Some(SystemTime::now());
    }

    /// Mark as deleted and drop everything still queued
    pub fn mark_deleted(&mut self) -> usize {
        self.state = SessionState::Deleted;
        self.inflight.clear();
        self.reserved_ids.clear();
        self.notify.notify_one();
        self.pending.clear()
    }

    /// Detached and past its expiry interval
    pub fn is_expired(&self) -> bool {
        if self.state != SessionState::Disconnected {
            return false;
        }
        if self.expiry_interval == SESSION_NEVER_EXPIRES {
            return false;
        }
        match self.disconnected_at {
            // a clock stepping backwards counts as no time passed
            Some(at) => {
                at.elapsed().unwrap_or(Duration::ZERO)
                    >= Duration::from_secs(u64::from(self.expiry_interval))
            }
            None => false,
        }
    }

    /// Queue a message for this session and wake its connection
    pub fn enqueue(&mut self, message: PendingMessage) -> Result<Enqueued, OverflowKind> {
        if self.state == SessionState::Deleted {
            message.complete(Err(DeliveryError::Overflow(OverflowKind::SessionClosed)));
            return Err(OverflowKind::SessionClosed);
        }
        let result = self.pending.push(message);
        if result.is_ok() {
            self.notify.notify_one();
        }
        result
    }

    /// Take the next message to send, assigning a packet id and recording it
    /// as in flight for QoS > 0. Returns `None` when the queue is empty or
    /// the send quota is used up.
    pub fn next_outgoing(&mut self, max_inflight: usize) -> Option<Outgoing> {
        loop {
            if max_inflight > 0 && self.inflight.len() >= max_inflight {
                return None;
            }
            let mut message = self.pending.pop_front()?;

            if let Some(expiry) = message.publish.properties.message_expiry_interval {
                let waited = message.enqueued_at.elapsed().as_secs();
                if waited >= u64::from(expiry) {
                    message.complete(Err(DeliveryError::Discarded));
                    continue;
                }
                message.publish.properties.message_expiry_interval = Some(expiry - waited as u32);
            }

            if message.publish.qos > QoS::AtMostOnce {
                let packet_id = match message.packet_id.take() {
                    Some(id) => {
                        self.reserved_ids.remove(&id);
                        id
                    }
                    None => match self.allocate_packet_id() {
                        Some(id) => id,
                        None => {
                            // every id in use, wait for acks to free some
                            self.pending.push_front(message);
                            return None;
                        }
                    },
                };
                message.publish.packet_id = Some(packet_id);
                self.send_seq += 1;
                self.inflight.insert(
                    packet_id,
                    InflightMessage {
                        packet_id,
                        publish: message.publish.clone(),
                        qos2_state: (message.publish.qos == QoS::ExactlyOnce)
                            .then_some(Qos2State::WaitingPubRec),
                        sent_at: Instant::now(),
                        retry_count: message.delivery_attempts,
                        seq: self.send_seq,
                    },
                );
            } else {
                message.publish.packet_id = None;
            }

            let completion = message.take_completion();
            return Some(Outgoing {
                publish: message.publish,
                completion,
            });
        }
    }

    /// PUBACK received. Returns the completed message.
    pub fn complete_puback(&mut self, packet_id: u16) -> Option<InflightMessage> {
        match self.inflight.get(&packet_id) {
            Some(m) if m.publish.qos == QoS::AtLeastOnce => self.inflight.remove(&packet_id),
            _ => None,
        }
    }

    /// PUBREC received. Returns false for an unknown packet id.
    pub fn complete_pubrec(&mut self, packet_id: u16) -> bool {
        match self.inflight.get_mut(&packet_id) {
            Some(m) if m.publish.qos == QoS::ExactlyOnce => {
                m.qos2_state = Some(Qos2State::WaitingPubComp);
                m.sent_at = Instant::now();
                m.retry_count = 0;
                true
            }
            _ => false,
        }
    }

    /// PUBCOMP received. Returns the completed message.
    pub fn complete_pubcomp(&mut self, packet_id: u16) -> Option<InflightMessage> {
        match self.inflight.get(&packet_id) {
            Some(m) if m.qos2_state == Some(Qos2State::WaitingPubComp) => {
                self.inflight.remove(&packet_id)
            }
            _ => None,
        }
    }

    /// Collect in-flight messages unacknowledged for longer than `timeout`.
    pub fn due_for_retry(&mut self, timeout: Duration, max_retries: u32) -> RetryOutcome {
        let now = Instant::now();
        let mut due: Vec<&mut InflightMessage> = self
            .inflight
            .values_mut()
            .filter(|m| now.duration_since(m.sent_at) >= timeout)
            .collect();
        due.sort_by_key(|m| m.seq);

        let mut packets = Vec::with_capacity(due.len());
        for message in due {
            if message.retry_count >= max_retries {
                return RetryOutcome::Exhausted(message.packet_id);
            }
            message.retry_count += 1;
            message.sent_at = now;
            packets.push(match message.qos2_state {
                Some(Qos2State::WaitingPubComp) => Packet::PubRel(PubRel::new(message.packet_id)),
                _ => {
                    let mut publish = message.publish.clone();
                    publish.dup = true;
                    Packet::Publish(publish)
                }
            });
        }
        RetryOutcome::Resend(packets)
    }

    /// Connection lost: move unacknowledged PUBLISHes back to the head of the
    /// pending queue, oldest first, flagged DUP. Messages already past PUBREC
    /// stay in flight and get their PUBREL resent on resume.
    pub fn requeue_inflight(&mut self) {
        let mut unacked: Vec<InflightMessage> = Vec::new();
        self.inflight.retain(|_, m| {
            if m.qos2_state == Some(Qos2State::WaitingPubComp) {
                true
            } else {
                unacked.push(m.clone());
                false
            }
        });
        unacked.sort_by_key(|m| std::cmp::Reverse(m.seq));

        for message in unacked {
            let mut publish = message.publish;
            publish.dup = true;
            self.reserved_ids.insert(message.packet_id);
            let mut pending = PendingMessage::new(publish);
            pending.packet_id = Some(message.packet_id);
            pending.delivery_attempts = message.retry_count;
            self.pending.push_front(pending);
        }
    }

    /// PUBRELs to resend when a connection resumes this session
    pub fn resume_packets(&mut self) -> Vec<Packet> {
        let now = Instant::now();
        let mut releases: Vec<&mut InflightMessage> = self.inflight.values_mut().collect();
        releases.sort_by_key(|m| m.seq);
        releases
            .into_iter()
            .map(|m| {
                m.sent_at = now;
                Packet::PubRel(PubRel::new(m.packet_id))
            })
            .collect()
    }

    /// Put back a queue loaded from storage, in delivery order. Packet ids
    /// carried by already-sent messages stay reserved.
    pub fn restore_pending(&mut self, messages: Vec<PendingMessage>) {
        for message in messages.into_iter().rev() {
            if let Some(id) = message.packet_id {
                self.reserved_ids.insert(id);
            }
            self.pending.push_front(message);
        }
    }

    /// Put back a QoS 2 handshake loaded from storage
    pub fn restore_inflight(&mut self, packet_id: u16, mut publish: Publish, state: Qos2State) {
        publish.packet_id = Some(packet_id);
        self.send_seq += 1;
        self.inflight.insert(
            packet_id,
            InflightMessage {
                packet_id,
                publish,
                qos2_state: Some(state),
                sent_at: Instant::now(),
                retry_count: 0,
                seq: self.send_seq,
            },
        );
    }

    /// Drop queued messages and start over with packet ids. Subscriptions
    /// and items are kept.
    pub fn clear_pending(&mut self) -> usize {
        self.reserved_ids.clear();
        self.pending.clear()
    }

    fn allocate_packet_id(&mut self) -> Option<u16> {
        for _ in 0..u16::MAX {
            let id = self.packet_ids.next_id();
            if !self.inflight.contains_key(&id) && !self.reserved_ids.contains(&id) {
                return Some(id);
            }
        }
        None
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("state", &self.state)
            .field("subscriptions", &self.subscriptions.len())
            .field("pending", &self.pending.len())
            .field("inflight", &self.inflight.len())
            .finish()
    }
}
