//! Bounded pending message queue
//!
//! Holds outbound messages that have been routed to a session but not yet
//! handed to its connection. A message popped by the delivery loop is in
//! flight and no longer counts against the capacity, so it can never be
//! evicted.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use serde::Deserialize;
use tokio::sync::oneshot;

use crate::protocol::Publish;

/// What to do when a message arrives at a full queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    /// Reject the incoming message, keep the queue as is
    #[default]
    DropNewMessage,
    /// Evict the oldest queued message to make room
    DropOldestQueuedMessage,
}

/// Why a direct enqueue was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowKind {
    /// Queue at capacity with `DropNewMessage`
    QueueFull,
    /// Session deleted or being deleted
    SessionClosed,
}

impl fmt::Display for OverflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "pending message queue is full"),
            Self::SessionClosed => write!(f, "session is closed"),
        }
    }
}

impl std::error::Error for OverflowKind {}

/// Outcome of a [`deliver_and_wait`](crate::broker::SessionStatus::deliver_and_wait)
/// that did not reach the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Refused at enqueue time
    Overflow(OverflowKind),
    /// Evicted by a newer message
    Evicted,
    /// Dropped before sending: expired, intercepted or session deleted
    Discarded,
    /// Not written within the allotted time
    Timeout,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow(kind) => write!(f, "overflow: {}", kind),
            Self::Evicted => write!(f, "evicted from pending queue"),
            Self::Discarded => write!(f, "discarded before delivery"),
            Self::Timeout => write!(f, "delivery timed out"),
        }
    }
}

impl std::error::Error for DeliveryError {}

impl From<OverflowKind> for DeliveryError {
    fn from(kind: OverflowKind) -> Self {
        DeliveryError::Overflow(kind)
    }
}

pub type DeliveryResult = Result<(), DeliveryError>;

/// One queued outbound message
#[derive(Debug)]
pub struct PendingMessage {
    /// Set when the message was already sent once and is waiting for redelivery
    pub packet_id: Option<u16>,
    pub publish: Publish,
    pub enqueued_at: Instant,
    pub delivery_attempts: u32,
    completion: Option<oneshot::Sender<DeliveryResult>>,
}

impl PendingMessage {
    pub fn new(publish: Publish) -> Self {
        Self {
            packet_id: None,
            publish,
            enqueued_at: Instant::now(),
            delivery_attempts: 0,
            completion: None,
        }
    }

    /// Attach a completion signalled once the message is written or dropped
    pub fn with_completion(mut self, tx: oneshot::Sender<DeliveryResult>) -> Self {
        self.completion = Some(tx);
        self
    }

    pub fn take_completion(&mut self) -> Option<oneshot::Sender<DeliveryResult>> {
        self.completion.take()
    }

    pub fn complete(mut self, result: DeliveryResult) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(result);
        }
    }
}

/// Result of a successful [`PendingQueue::push`]
#[derive(Debug)]
pub enum Enqueued {
    Queued,
    /// Queued after evicting this older message
    Evicted(PendingMessage),
}

#[derive(Debug)]
pub struct PendingQueue {
    entries: VecDeque<PendingMessage>,
    /// 0 = unbounded
    capacity: usize,
    strategy: OverflowStrategy,
}

impl PendingQueue {
    pub fn new(capacity: usize, strategy: OverflowStrategy) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            strategy,
        }
    }

    /// Append a message, applying the overflow strategy when full.
    ///
    /// A rejected message has its completion signalled before this returns.
    pub fn push(&mut self, message: PendingMessage) -> Result<Enqueued, OverflowKind> {
        if self.capacity == 0 || self.entries.len() < self.capacity {
            self.entries.push_back(message);
            return Ok(Enqueued::Queued);
        }

        match self.strategy {
            OverflowStrategy::DropNewMessage => {
                message.complete(Err(DeliveryError::Overflow(OverflowKind::QueueFull)));
                Err(OverflowKind::QueueFull)
            }
            OverflowStrategy::DropOldestQueuedMessage => match self.entries.pop_front() {
                Some(evicted) => {
                    self.entries.push_back(message);
                    Ok(Enqueued::Evicted(evicted))
                }
                None => {
                    // capacity > 0 and nothing queued cannot happen, but stay total
                    self.entries.push_back(message);
                    Ok(Enqueued::Queued)
                }
            },
        }
    }

    /// Put a message back at the head, ignoring capacity. Used for messages
    /// that were in flight when the connection went away.
    pub fn push_front(&mut self, message: PendingMessage) {
        self.entries.push_front(message);
    }

    pub fn pop_front(&mut self) -> Option<PendingMessage> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingMessage> {
        self.entries.iter()
    }

    pub fn set_limits(&mut self, capacity: usize, strategy: OverflowStrategy) {
        self.capacity = capacity;
        self.strategy = strategy;
    }

    /// Drop every queued message, signalling their completions
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        for message in self.entries.drain(..) {
            message.complete(Err(DeliveryError::Discarded));
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QoS;

    fn message(payload: &'static str) -> PendingMessage {
        PendingMessage::new(Publish::new("t", payload, QoS::AtLeastOnce))
    }

    fn payloads(queue: &PendingQueue) -> Vec<String> {
        queue
            .iter()
            .map(|m| String::from_utf8_lossy(&m.publish.payload).into_owned())
            .collect()
    }

    #[test]
    fn test_drop_new_message_keeps_queue() {
        let mut queue = PendingQueue::new(1, OverflowStrategy::DropNewMessage);
        queue.push(message("1")).unwrap();
        // "1" is now in flight
        queue.pop_front().unwrap();

        assert!(matches!(queue.push(message("2")), Ok(Enqueued::Queued)));
        assert_eq!(queue.push(message("3")).unwrap_err(), OverflowKind::QueueFull);
        assert_eq!(payloads(&queue), vec!["2"]);
    }

    #[test]
    fn test_drop_oldest_evicts_only_queued() {
        let mut queue = PendingQueue::new(1, OverflowStrategy::DropOldestQueuedMessage);
        queue.push(message("1")).unwrap();
        queue.pop_front().unwrap();

        assert!(matches!(queue.push(message("2")), Ok(Enqueued::Queued)));
        match queue.push(message("3")) {
            Ok(Enqueued::Evicted(evicted)) => assert_eq!(&evicted.publish.payload[..], b"2"),
            other => panic!("expected eviction, got {:?}", other),
        }
        assert_eq!(payloads(&queue), vec!["3"]);
    }

    #[test]
    fn test_unbounded_when_capacity_zero() {
        let mut queue = PendingQueue::new(0, OverflowStrategy::DropNewMessage);
        for _ in 0..1000 {
            queue.push(message("x")).unwrap();
        }
        assert_eq!(queue.len(), 1000);
    }

    #[test]
    fn test_fifo_with_requeued_head() {
        let mut queue = PendingQueue::new(0, OverflowStrategy::DropNewMessage);
        for p in ["0", "2", "1"] {
            queue.push(message(p)).unwrap();
        }
        let head = queue.pop_front().unwrap();
        queue.push(message("4")).unwrap();
        queue.push_front(head);
        assert_eq!(payloads(&queue), vec!["0", "2", "1", "4"]);
    }

    #[tokio::test]
    async fn test_rejected_message_completion_is_signalled() {
        let mut queue = PendingQueue::new(1, OverflowStrategy::DropNewMessage);
        queue.push(message("1")).unwrap();

        let (tx, rx) = oneshot::channel();
        let _ = queue.push(message("2").with_completion(tx));
        assert_eq!(
            rx.await.unwrap(),
            Err(DeliveryError::Overflow(OverflowKind::QueueFull))
        );
    }
}
