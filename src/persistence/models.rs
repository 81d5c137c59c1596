//! Serializable data models for persistence.
//!
//! These are storage-friendly versions of runtime types that can be
//! serialized with bincode. Instants are stored as unix seconds.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};

use crate::broker::RetainedMessage;
use crate::protocol::{
    ApplicationMessage, Properties, ProtocolVersion, Publish, QoS, RetainHandling,
    SubscriptionOptions,
};
use crate::session::{PendingMessage, Qos2State, Session};
use crate::topic::Subscription;

/// Stored retained message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredRetainedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub properties: StoredProperties,
    /// Unix timestamp in seconds when the message was stored
    pub timestamp_secs: u64,
}

/// Stored session
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSession {
    pub client_id: String,
    pub protocol_version: u8,
    pub session_expiry_interval: u32,
    pub subscriptions: Vec<StoredSubscription>,
    /// Queue contents in delivery order
    pub pending_messages: Vec<StoredPendingMessage>,
    /// QoS 2 messages waiting for PUBCOMP
    pub inflight: Vec<StoredInflightMessage>,
    pub will: Option<StoredWillMessage>,
    pub will_delay_interval: u32,
    pub created_at_secs: u64,
    /// Unix timestamp when disconnected, if applicable
    pub disconnected_at_secs: Option<u64>,
}

/// Stored subscription
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredSubscription {
    pub filter: String,
    pub qos: u8,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: u8,
    pub subscription_id: Option<u32>,
}

/// Stored pending message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredPendingMessage {
    /// Set for messages that were already sent once
    pub packet_id: Option<u16>,
    pub publish: StoredPublish,
    /// Unix timestamp when queued
    pub queued_at_secs: u64,
    pub delivery_attempts: u32,
}

/// Stored inflight message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredInflightMessage {
    pub packet_id: u16,
    pub publish: StoredPublish,
    /// 0 = None, 1 = WaitingPubRec, 2 = WaitingPubComp
    pub qos2_state: u8,
    pub retry_count: u32,
}

/// Stored publish message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
    pub properties: StoredProperties,
}

/// Stored will message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct StoredWillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub properties: StoredProperties,
}

/// Stored MQTT v5 properties (subset relevant for persistence)
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct StoredProperties {
    pub payload_format_indicator: Option<u8>,
    pub message_expiry_interval: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation_data: Option<Vec<u8>>,
    pub user_properties: Vec<(String, String)>,
    pub subscription_identifiers: Vec<u32>,
}

// ============================================================================
// Conversion implementations
// ============================================================================

pub(crate) fn now_unix_secs() -> u64 {
    system_time_to_unix_secs(SystemTime::now())
}

fn system_time_to_unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn unix_secs_to_system_time(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

fn instant_to_unix_secs(instant: Instant) -> u64 {
    // Instant has no wall clock; go through the current offset
    let now = Instant::now();
    let system_now = SystemTime::now();

    if instant <= now {
        let elapsed = now.duration_since(instant);
        system_now
            .checked_sub(elapsed)
            .map(system_time_to_unix_secs)
            .unwrap_or(0)
    } else {
        now_unix_secs()
    }
}

fn unix_secs_to_instant(secs: u64) -> Instant {
    let now = Instant::now();
    let now_unix = now_unix_secs();

    if secs <= now_unix {
        let elapsed = Duration::from_secs(now_unix - secs);
        now.checked_sub(elapsed).unwrap_or(now)
    } else {
        now
    }
}

impl From<&Properties> for StoredProperties {
    fn from(props: &Properties) -> Self {
        Self {
            payload_format_indicator: props.payload_format_indicator,
            message_expiry_interval: props.message_expiry_interval,
            content_type: props.content_type.clone(),
            response_topic: props.response_topic.clone(),
            correlation_data: props.correlation_data.as_ref().map(|b| b.to_vec()),
            user_properties: props.user_properties.clone(),
            subscription_identifiers: props.subscription_identifiers.to_vec(),
        }
    }
}

impl From<StoredProperties> for Properties {
    fn from(stored: StoredProperties) -> Self {
        Properties {
            payload_format_indicator: stored.payload_format_indicator,
            message_expiry_interval: stored.message_expiry_interval,
            content_type: stored.content_type,
            response_topic: stored.response_topic,
            correlation_data: stored.correlation_data.map(bytes::Bytes::from),
            user_properties: stored.user_properties,
            subscription_identifiers: stored.subscription_identifiers.into_iter().collect(),
            ..Default::default()
        }
    }
}

impl From<&Publish> for StoredPublish {
    fn from(publish: &Publish) -> Self {
        Self {
            topic: publish.topic.to_string(),
            payload: publish.payload.to_vec(),
            qos: publish.qos as u8,
            retain: publish.retain,
            dup: publish.dup,
            properties: StoredProperties::from(&publish.properties),
        }
    }
}

impl From<StoredPublish> for Publish {
    fn from(stored: StoredPublish) -> Self {
        Self {
            topic: Arc::from(stored.topic),
            payload: bytes::Bytes::from(stored.payload),
            qos: QoS::from_u8(stored.qos).unwrap_or_default(),
            retain: stored.retain,
            dup: stored.dup,
            packet_id: None,
            properties: Properties::from(stored.properties),
        }
    }
}

impl From<&ApplicationMessage> for StoredWillMessage {
    fn from(will: &ApplicationMessage) -> Self {
        Self {
            topic: will.topic.to_string(),
            payload: will.payload.to_vec(),
            qos: will.qos as u8,
            retain: will.retain,
            properties: StoredProperties::from(&will.properties),
        }
    }
}

impl From<StoredWillMessage> for ApplicationMessage {
    fn from(stored: StoredWillMessage) -> Self {
        Self {
            topic: Arc::from(stored.topic),
            payload: bytes::Bytes::from(stored.payload),
            qos: QoS::from_u8(stored.qos).unwrap_or_default(),
            retain: stored.retain,
            properties: Properties::from(stored.properties),
        }
    }
}

impl From<&Subscription> for StoredSubscription {
    fn from(sub: &Subscription) -> Self {
        Self {
            filter: sub.filter.to_string(),
            qos: sub.options.qos as u8,
            no_local: sub.options.no_local,
            retain_as_published: sub.options.retain_as_published,
            retain_handling: sub.options.retain_handling as u8,
            subscription_id: sub.identifier,
        }
    }
}

impl From<&StoredSubscription> for Subscription {
    fn from(stored: &StoredSubscription) -> Self {
        let options = SubscriptionOptions {
            qos: QoS::from_u8(stored.qos).unwrap_or_default(),
            no_local: stored.no_local,
            retain_as_published: stored.retain_as_published,
            retain_handling: RetainHandling::from_u8(stored.retain_handling).unwrap_or_default(),
        };
        Subscription::new(&stored.filter, options, stored.subscription_id)
    }
}

impl From<&PendingMessage> for StoredPendingMessage {
    fn from(pm: &PendingMessage) -> Self {
        Self {
            packet_id: pm.packet_id,
            publish: StoredPublish::from(&pm.publish),
            queued_at_secs: instant_to_unix_secs(pm.enqueued_at),
            delivery_attempts: pm.delivery_attempts,
        }
    }
}

impl From<StoredPendingMessage> for PendingMessage {
    fn from(stored: StoredPendingMessage) -> Self {
        let mut message = PendingMessage::new(Publish::from(stored.publish));
        message.packet_id = stored.packet_id;
        message.enqueued_at = unix_secs_to_instant(stored.queued_at_secs);
        message.delivery_attempts = stored.delivery_attempts;
        message
    }
}

impl From<&RetainedMessage> for StoredRetainedMessage {
    fn from(rm: &RetainedMessage) -> Self {
        Self {
            topic: rm.message.topic.to_string(),
            payload: rm.message.payload.to_vec(),
            qos: rm.message.qos as u8,
            properties: StoredProperties::from(&rm.message.properties),
            timestamp_secs: instant_to_unix_secs(rm.stored_at),
        }
    }
}

impl From<StoredRetainedMessage> for RetainedMessage {
    fn from(stored: StoredRetainedMessage) -> Self {
        RetainedMessage {
            message: ApplicationMessage {
                topic: Arc::from(stored.topic),
                payload: bytes::Bytes::from(stored.payload),
                qos: QoS::from_u8(stored.qos).unwrap_or_default(),
                retain: true,
                properties: Properties::from(stored.properties),
            },
            stored_at: unix_secs_to_instant(stored.timestamp_secs),
        }
    }
}

impl StoredSession {
    /// Snapshot a detached session. Messages still in flight before PUBREC
    /// are expected to have been requeued already.
    pub fn from_session(session: &Session) -> Self {
        let mut inflight: Vec<StoredInflightMessage> = session
            .inflight
            .values()
            .map(|m| StoredInflightMessage {
                packet_id: m.packet_id,
                publish: StoredPublish::from(&m.publish),
                qos2_state: match m.qos2_state {
                    None => 0,
                    Some(Qos2State::WaitingPubRec) => 1,
                    Some(Qos2State::WaitingPubComp) => 2,
                },
                retry_count: m.retry_count,
            })
            .collect();
        inflight.sort_by_key(|m| m.packet_id);

        Self {
            client_id: session.client_id.to_string(),
            protocol_version: session.protocol_version as u8,
            session_expiry_interval: session.expiry_interval,
            subscriptions: session
                .subscriptions
                .iter()
                .map(StoredSubscription::from)
                .collect(),
            pending_messages: session
                .pending
                .iter()
                .map(StoredPendingMessage::from)
                .collect(),
            inflight,
            will: session.will.as_ref().map(StoredWillMessage::from),
            will_delay_interval: session.will_delay_interval,
            created_at_secs: system_time_to_unix_secs(session.created_at),
            disconnected_at_secs: session.disconnected_at.map(system_time_to_unix_secs),
        }
    }

    /// Rebuild the detached session. Queue limits come from the current
    /// configuration, not from the snapshot.
    pub fn into_session(
        self,
        max_pending: usize,
        overflow: crate::session::OverflowStrategy,
    ) -> Session {
        let version = ProtocolVersion::from_u8(self.protocol_version).unwrap_or(ProtocolVersion::V311);
        let mut session = Session::new(Arc::from(self.client_id), version, max_pending, overflow);
        session.expiry_interval = self.session_expiry_interval;
        session.is_persistent = true;
        session.created_at = unix_secs_to_system_time(self.created_at_secs);
        session.will = self.will.map(ApplicationMessage::from);
        session.will_delay_interval = self.will_delay_interval;
        session.mark_disconnected();
        if let Some(secs) = self.disconnected_at_secs {
            session.disconnected_at = Some(unix_secs_to_system_time(secs));
        }

        for stored in &self.subscriptions {
            session.subscriptions.insert(Subscription::from(stored));
        }
        for stored in self.inflight {
            let qos2_state = match stored.qos2_state {
                2 => Qos2State::WaitingPubComp,
                _ => Qos2State::WaitingPubRec,
            };
            session.restore_inflight(stored.packet_id, Publish::from(stored.publish), qos2_state);
        }
        session.restore_pending(
            self.pending_messages
                .into_iter()
                .map(PendingMessage::from)
                .collect(),
        );
        session
    }
}

/// Data loaded from persistence at startup
#[derive(Debug, Default)]
pub struct LoadedData {
    pub retained: Vec<(String, StoredRetainedMessage)>,
    pub sessions: Vec<(String, StoredSession)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::OverflowStrategy;

    #[test]
    fn test_session_snapshot_restores_queue_and_subscriptions() {
        let mut session = Session::new(
            Arc::from("c1"),
            ProtocolVersion::V5,
            10,
            OverflowStrategy::DropNewMessage,
        );
        session.mark_connected();
        session.expiry_interval = 3600;
        session.subscriptions.insert(Subscription::new(
            "a/+",
            SubscriptionOptions::with_qos(QoS::AtLeastOnce),
            Some(7),
        ));
        for payload in ["1", "2", "3"] {
            session
                .enqueue(PendingMessage::new(Publish::new("a/b", payload, QoS::AtLeastOnce)))
                .unwrap();
        }
        let sent = session.next_outgoing(0).unwrap();
        session.mark_disconnected();
        session.requeue_inflight();

        let stored = StoredSession::from_session(&session);
        let bytes = bincode::encode_to_vec(&stored, bincode::config::standard()).unwrap();
        let (decoded, _): (StoredSession, usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(decoded, stored);

        let mut restored = decoded.into_session(10, OverflowStrategy::DropNewMessage);
        assert!(!restored.is_connected());
        assert!(restored.subscriptions.contains("a/+"));
        assert_eq!(restored.subscriptions.get("a/+").unwrap().identifier, Some(7));

        restored.mark_connected();
        let first = restored.next_outgoing(0).unwrap();
        assert_eq!(first.publish.packet_id, sent.publish.packet_id);
        assert!(first.publish.dup);
        let rest: Vec<_> = std::iter::from_fn(|| restored.next_outgoing(0))
            .map(|o| o.publish.payload)
            .collect();
        assert_eq!(rest, vec!["2", "3"]);
    }

    #[test]
    fn test_retained_roundtrip_keeps_properties() {
        let mut message = ApplicationMessage::new("t", "v").with_qos(QoS::AtLeastOnce);
        message.properties.content_type = Some("text/plain".into());
        let stored = StoredRetainedMessage::from(&RetainedMessage::new(message.clone()));

        let restored = RetainedMessage::from(stored);
        assert_eq!(restored.message.payload, message.payload);
        assert_eq!(restored.message.qos, QoS::AtLeastOnce);
        assert!(restored.message.retain);
        assert_eq!(restored.message.properties.content_type.as_deref(), Some("text/plain"));
    }
}
