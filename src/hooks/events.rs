//! Arguments passed to hook callbacks
//!
//! Interception arguments are handed out as `&mut` so a hook can rewrite
//! them or abort the operation through their flags. Event arguments are
//! immutable and also broadcast as [`BrokerEvent`](crate::broker::BrokerEvent).

use std::sync::Arc;

use bytes::Bytes;

use crate::protocol::{
    ApplicationMessage, Packet, ProtocolVersion, Publish, QoS, ReasonCode, SubscriptionOptions,
};
use crate::session::SessionItems;

/// CONNECT awaiting validation
#[derive(Debug)]
pub struct ValidatingConnection {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub endpoint: String,
    pub protocol_version: ProtocolVersion,
    pub clean_start: bool,
    pub session_expiry_interval: u32,
    pub keep_alive: u16,
    /// User properties sent by the client in CONNECT
    pub user_properties: Vec<(String, String)>,
    /// Bag attached to the session once the connection is accepted
    pub session_items: Arc<SessionItems>,

    /// Anything but a success code rejects the connection
    pub reason_code: ReasonCode,
    /// Replaces an empty client identifier
    pub assigned_client_identifier: Option<String>,
    /// Sent with `UseAnotherServer` / `ServerMoved`
    pub server_reference: Option<String>,
    pub reason_string: Option<String>,
    pub response_user_properties: Vec<(String, String)>,
}

impl ValidatingConnection {
    pub fn is_accepted(&self) -> bool {
        self.reason_code.is_success()
    }
}

/// A message about to be routed
#[derive(Debug, Clone)]
pub struct InterceptingPublish {
    pub message: ApplicationMessage,
    /// Publishing client, `None` for server-side injection without sender
    pub client_id: Option<Arc<str>>,
    pub session_items: Option<Arc<SessionItems>>,

    /// When false the message is acknowledged but neither retained nor routed
    pub process_publish: bool,
    pub close_connection: bool,
    pub reason_code: ReasonCode,
    pub reason_string: Option<String>,
    /// Returned in the PUBACK/PUBREC (v5)
    pub user_properties: Vec<(String, String)>,
}

impl InterceptingPublish {
    pub fn new(
        message: ApplicationMessage,
        client_id: Option<Arc<str>>,
        session_items: Option<Arc<SessionItems>>,
    ) -> Self {
        Self {
            message,
            client_id,
            session_items,
            process_publish: true,
            close_connection: false,
            reason_code: ReasonCode::Success,
            reason_string: None,
            user_properties: Vec::new(),
        }
    }

    pub fn is_aborted(&self) -> bool {
        !self.process_publish || self.close_connection
    }
}

/// One filter of a SUBSCRIBE, before it reaches the subscription index
#[derive(Debug, Clone)]
pub struct InterceptingSubscription {
    pub client_id: Arc<str>,
    pub session_items: Arc<SessionItems>,
    /// May be rewritten
    pub filter: String,
    pub options: SubscriptionOptions,
    pub identifier: Option<u32>,

    pub process_subscription: bool,
    pub close_connection: bool,
    /// Granted code; set an error code to deny this filter
    pub reason_code: ReasonCode,
    pub reason_string: Option<String>,
}

impl InterceptingSubscription {
    pub fn is_aborted(&self) -> bool {
        !self.process_subscription || self.close_connection || self.reason_code.is_error()
    }
}

/// One filter of an UNSUBSCRIBE
#[derive(Debug, Clone)]
pub struct InterceptingUnsubscription {
    pub client_id: Arc<str>,
    pub session_items: Arc<SessionItems>,
    pub filter: String,

    pub process_unsubscription: bool,
    pub close_connection: bool,
    pub reason_code: ReasonCode,
}

impl InterceptingUnsubscription {
    pub fn is_aborted(&self) -> bool {
        !self.process_unsubscription || self.close_connection || self.reason_code.is_error()
    }
}

/// A packet about to be written to a client
#[derive(Debug, Clone)]
pub struct InterceptingOutbound {
    pub client_id: Arc<str>,
    pub packet: Packet,
    /// When false the packet is dropped silently
    pub accept: bool,
}

/// One copy of a routed message about to enter a session queue
#[derive(Debug, Clone)]
pub struct InterceptingClientEnqueue {
    pub sender_client_id: Option<Arc<str>>,
    pub receiver_client_id: Arc<str>,
    pub publish: Publish,
    pub accept_enqueue: bool,
}

/// How a connection that reached the connected state ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectType {
    /// DISCONNECT received from the client
    Clean,
    /// Transport loss, protocol error, timeout or server-side close
    NotClean,
    /// Replaced by a newer connection with the same client id
    Takeover,
}

#[derive(Debug, Clone)]
pub struct ClientConnected {
    pub client_id: Arc<str>,
    pub username: Option<String>,
    pub endpoint: String,
    pub protocol_version: ProtocolVersion,
    pub session_items: Arc<SessionItems>,
}

#[derive(Debug, Clone)]
pub struct ClientDisconnected {
    pub client_id: Arc<str>,
    pub endpoint: String,
    pub disconnect_type: DisconnectType,
    pub reason_code: ReasonCode,
    pub session_items: Arc<SessionItems>,
}

#[derive(Debug, Clone)]
pub struct ClientSubscribed {
    pub client_id: Arc<str>,
    pub filter: Arc<str>,
    pub options: SubscriptionOptions,
    pub session_items: Arc<SessionItems>,
}

#[derive(Debug, Clone)]
pub struct ClientUnsubscribed {
    pub client_id: Arc<str>,
    pub filter: String,
    pub session_items: Arc<SessionItems>,
}

/// QoS 1 PUBACK or QoS 2 PUBCOMP received for an outbound message
#[derive(Debug, Clone)]
pub struct ClientAcknowledged {
    pub client_id: Arc<str>,
    pub packet_id: u16,
    pub qos: QoS,
    pub topic: Arc<str>,
    pub is_completed: bool,
}

/// A routed message with no matching subscriber
#[derive(Debug, Clone)]
pub struct MessageNotConsumed {
    pub sender_client_id: Option<Arc<str>>,
    pub message: ApplicationMessage,
}

#[derive(Debug, Clone)]
pub struct MessageEnqueuedOrDropped {
    pub sender_client_id: Option<Arc<str>>,
    pub receiver_client_id: Arc<str>,
    pub publish: Publish,
    pub dropped: bool,
}

/// An older queued message evicted by `DropOldestQueuedMessage`
#[derive(Debug, Clone)]
pub struct QueuedMessageOverwritten {
    pub receiver_client_id: Arc<str>,
    pub overwritten: Publish,
}

/// Fired after every retained store mutation, with the full current set
#[derive(Debug, Clone)]
pub struct RetainedMessageChanged {
    pub client_id: Option<Arc<str>>,
    pub changed: ApplicationMessage,
    pub stored: Vec<ApplicationMessage>,
}

#[derive(Debug, Clone)]
pub struct SessionDeleted {
    pub client_id: Arc<str>,
    pub session_items: Arc<SessionItems>,
}
