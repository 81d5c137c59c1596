//! Sessions manager
//!
//! Owns every session and every live connection handle, and runs the paths
//! that touch more than one session: connect and takeover, publish fan-out,
//! retained replay, will publication and session deletion.
//!
//! Locking: the sessions map and the clients map are `DashMap`s, each
//! session sits behind its own `RwLock`. No session lock is held while a map
//! shard is locked for writing, and no lock is held across an `.await`.

mod status;

pub use status::SessionStatus;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::RwLock;
use tokio::sync::{oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::client::{ClientControl, ClientHandle, ClientInfo, ServerClose};
use super::events::EventHub;
use super::retained::{RetainedMessage, RetainedStore};
use super::{BrokerConfig, BrokerError};
use crate::hooks::{
    ClientSubscribed, ClientUnsubscribed, HookError, InterceptingClientEnqueue,
    InterceptingPublish, InterceptingSubscription, InterceptingUnsubscription,
    MessageEnqueuedOrDropped, MessageNotConsumed, QueuedMessageOverwritten,
    RetainedMessageChanged, SessionDeleted,
};
use crate::persistence::{
    LoadedData, PersistenceManager, PersistenceOp, StoredRetainedMessage, StoredSession,
};
use crate::protocol::{
    ApplicationMessage, ProtocolVersion, Publish, QoS, ReasonCode, RetainHandling,
    SubscriptionOptions,
};
use crate::session::{
    DeliveryError, DeliveryResult, Enqueued, PendingMessage, Session, SessionItems, SessionState,
};
use crate::topic::{self, Subscription, TopicHash};

pub(crate) type SharedSession = Arc<RwLock<Session>>;

/// Outcome of routing one application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResult {
    /// `Success`, `NoMatchingSubscribers` or whatever the publish
    /// interceptor decided
    pub reason_code: ReasonCode,
    /// Set by the publish interceptor: close the publishing connection
    pub close_connection: bool,
    pub reason_string: Option<String>,
    pub user_properties: Vec<(String, String)>,
    /// Number of sessions with at least one matching subscription
    pub matching_subscribers: usize,
}

/// What a connecting client asks for, after validation
pub(crate) struct SessionRequest {
    pub clean_start: bool,
    /// Seconds; 0 ends the session with the connection
    pub session_expiry_interval: u32,
    pub will: Option<ApplicationMessage>,
    pub will_delay_interval: u32,
    pub items: Arc<SessionItems>,
}

/// A session attached to a new connection
pub(crate) struct Attached {
    pub session: SharedSession,
    pub session_present: bool,
    pub handle: Arc<ClientHandle>,
    pub control: ClientControl,
}

/// Result of one SUBSCRIBE filter
#[derive(Debug)]
pub(crate) struct SubscribeOutcome {
    pub reason_code: ReasonCode,
    pub close_connection: bool,
    /// Retained messages to replay, enqueued by the caller after SUBACK
    pub retained: Vec<Publish>,
}

impl SubscribeOutcome {
    fn rejected(reason_code: ReasonCode) -> Self {
        Self {
            reason_code,
            close_connection: false,
            retained: Vec::new(),
        }
    }
}

pub(crate) struct SessionsManager {
    config: Arc<BrokerConfig>,
    sessions: DashMap<Arc<str>, SharedSession>,
    clients: DashMap<Arc<str>, Arc<ClientHandle>>,
    retained: RetainedStore,
    events: EventHub,
    persistence: RwLock<Option<Arc<PersistenceManager>>>,
    /// Serializes connect and takeover
    connect_lock: Mutex<()>,
    /// Set by `disconnect_all`, new connections are refused
    closing: AtomicBool,
    delayed_wills: DashMap<Arc<str>, AbortHandle>,
}

impl SessionsManager {
    pub fn new(config: Arc<BrokerConfig>, events: EventHub) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            clients: DashMap::new(),
            retained: RetainedStore::new(),
            events,
            persistence: RwLock::new(None),
            connect_lock: Mutex::new(()),
            closing: AtomicBool::new(false),
            delayed_wills: DashMap::new(),
        }
    }

    pub fn config(&self) -> &Arc<BrokerConfig> {
        &self.config
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn retained(&self) -> &RetainedStore {
        &self.retained
    }

    pub fn set_persistence(&self, persistence: Arc<PersistenceManager>) {
        *self.persistence.write() = Some(persistence);
    }

    fn persistence(&self) -> Option<Arc<PersistenceManager>> {
        self.persistence.read().clone()
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn session(&self, client_id: &str) -> Option<SharedSession> {
        self.sessions.get(client_id).map(|e| e.value().clone())
    }

    pub fn sessions(&self) -> Vec<(Arc<str>, SharedSession)> {
        self.sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn client(&self, client_id: &str) -> Option<Arc<ClientHandle>> {
        self.clients.get(client_id).map(|e| e.value().clone())
    }

    pub fn clients(&self) -> Vec<Arc<ClientHandle>> {
        self.clients.iter().map(|e| e.value().clone()).collect()
    }

    // ========================================================================
    // Connect / disconnect
    // ========================================================================

    /// Attach a session to a validated connection.
    ///
    /// A live connection with the same client id is closed first with
    /// `SessionTakenOver`, and its cleanup is awaited so its disconnect event
    /// fires before the new connect event. Fails with
    /// [`BrokerError::Shutdown`] once [`disconnect_all`](Self::disconnect_all)
    /// has started.
    pub async fn attach(
        &self,
        request: SessionRequest,
        info: ClientInfo,
    ) -> Result<Attached, BrokerError> {
        let _guard = self.connect_lock.lock().await;
        if self.closing.load(Ordering::Acquire) {
            return Err(BrokerError::Shutdown);
        }
        let client_id = info.client_id.clone();

        if let Some(existing) = self.client(&client_id) {
            debug!("Taking over session of {} from {}", client_id, existing.endpoint);
            existing.request_disconnect(ReasonCode::SessionTakenOver, ServerClose::Takeover);
            if !existing.wait_closed(self.config.communication_timeout).await {
                warn!("Previous connection of {} did not close in time", client_id);
            }
            self.clients
                .remove_if(&client_id, |_, c| Arc::ptr_eq(c, &existing));
        }

        if let Some((_, will)) = self.delayed_wills.remove(&client_id) {
            debug!("Session of {} resumed, cancelling delayed will", client_id);
            will.abort();
        }

        let persistent =
            self.config.persistent_sessions && request.session_expiry_interval > 0;

        let mut resumable = match self.session(&client_id) {
            Some(existing) if request.clean_start || existing.read().is_expired() => {
                self.delete_session(&client_id, Some(&existing)).await;
                None
            }
            other => other,
        };

        let (session, session_present, generation) = loop {
            let (session, present) = match resumable.take() {
                Some(existing) => (existing, true),
                None => (self.new_session(&client_id, info.protocol_version), false),
            };
            let mut s = session.write();
            // deleted by the management API between lookup and lock
            if s.state == SessionState::Deleted {
                continue;
            }
            s.protocol_version = info.protocol_version;
            s.expiry_interval = request.session_expiry_interval;
            s.is_persistent = persistent;
            s.will = request.will.clone();
            s.will_delay_interval = request.will_delay_interval;
            s.items = request.items.clone();
            s.pending
                .set_limits(self.config.max_pending_messages, self.config.overflow_strategy);
            s.mark_connected();
            let generation = s.generation;
            drop(s);
            break (session, present, generation);
        };

        let (handle, control) = ClientHandle::new(info, generation);
        let handle = Arc::new(handle);
        self.clients.insert(client_id.clone(), handle.clone());

        debug!(
            "Session attached for {} (present: {}, persistent: {})",
            client_id, session_present, persistent
        );

        Ok(Attached {
            session,
            session_present,
            handle,
            control,
        })
    }

    fn new_session(&self, client_id: &Arc<str>, version: ProtocolVersion) -> SharedSession {
        let session = Arc::new(RwLock::new(Session::new(
            client_id.clone(),
            version,
            self.config.max_pending_messages,
            self.config.overflow_strategy,
        )));
        self.sessions.insert(client_id.clone(), session.clone());
        session
    }

    /// Detach a session from its closing connection.
    ///
    /// Does nothing to the session if a newer connection already attached
    /// it. Otherwise in-flight messages are requeued, the will is published
    /// or scheduled, and the session is deleted or snapshotted.
    pub async fn detach(
        self: &Arc<Self>,
        handle: &ClientHandle,
        session: &SharedSession,
        publish_will: bool,
    ) {
        let client_id = handle.client_id.clone();
        self.clients
            .remove_if(&client_id, |_, c| c.generation == handle.generation);

        let (persistent, will, delayed) = {
            let mut s = session.write();
            if s.generation != handle.generation || s.state == SessionState::Deleted {
                return;
            }
            s.requeue_inflight();
            s.mark_disconnected();
            let delay = s.will_delay_interval.min(s.expiry_interval);
            if !publish_will {
                s.will = None;
            }
            // a delayed will stays in the session so snapshots carry it
            let delayed = s.is_persistent && delay > 0 && s.will.is_some();
            let will = if delayed { None } else { s.will.take() };
            (s.is_persistent, will, delayed.then_some(delay))
        };

        if let Some(delay) = delayed {
            self.schedule_will(
                client_id.clone(),
                session.clone(),
                Duration::from_secs(u64::from(delay)),
            );
        }
        if let Some(will) = will {
            debug!("Publishing will of {}", client_id);
            self.dispatch_publish(will, Some(client_id.clone()), None)
                .await;
        }

        if persistent {
            self.persist_session(session);
        } else {
            self.delete_session(&client_id, Some(session)).await;
        }
    }

    /// Publish the will held by `session` after `delay`, unless a
    /// connection resumes the session first.
    fn schedule_will(self: &Arc<Self>, client_id: Arc<str>, session: SharedSession, delay: Duration) {
        debug!("Will of {} delayed by {:?}", client_id, delay);
        let manager = Arc::clone(self);
        let id = client_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.delayed_wills.remove(&id);
            let will = {
                let mut s = session.write();
                if s.is_connected() {
                    None
                } else {
                    s.will.take()
                }
            };
            let Some(will) = will else {
                return;
            };
            debug!("Publishing delayed will of {}", id);
            manager.dispatch_publish(will, Some(id), None).await;
            manager.persist_session(&session);
        });
        if let Some(previous) = self.delayed_wills.insert(client_id, task.abort_handle()) {
            previous.abort();
        }
    }

    /// Remove a session and fire `SessionDeleted`. With `expected`, only that
    /// exact session instance is removed.
    pub async fn delete_session(
        &self,
        client_id: &Arc<str>,
        expected: Option<&SharedSession>,
    ) -> bool {
        let removed = match expected {
            Some(expected) => self
                .sessions
                .remove_if(client_id, |_, s| Arc::ptr_eq(s, expected)),
            None => self.sessions.remove(client_id),
        };
        let Some((_, session)) = removed else {
            return false;
        };

        let (dropped, items) = {
            let mut s = session.write();
            (s.mark_deleted(), s.items.clone())
        };
        if let Some(persistence) = self.persistence() {
            persistence.write(PersistenceOp::RemoveSession {
                client_id: client_id.to_string(),
            });
        }
        debug!("Session {} deleted ({} queued messages dropped)", client_id, dropped);

        self.events
            .session_deleted(SessionDeleted {
                client_id: client_id.clone(),
                session_items: items,
            })
            .await;
        true
    }

    /// Delete a session from the management API, closing its connection
    /// first if there is one.
    pub async fn remove_session(&self, client_id: &Arc<str>) -> bool {
        if !self.sessions.contains_key(client_id) {
            return false;
        }
        if let Some(client) = self.client(client_id) {
            client.request_disconnect(ReasonCode::AdministrativeAction, ServerClose::Administrative);
            client.wait_closed(self.config.communication_timeout).await;
        }
        // a non-persistent session is already gone with its connection
        self.delete_session(client_id, None).await;
        true
    }

    /// Delete every detached session past its expiry interval
    pub async fn remove_expired_sessions(&self) -> usize {
        // a session resumed while the sweep runs must not be deleted
        let _guard = self.connect_lock.lock().await;
        let expired: Vec<(Arc<str>, SharedSession)> = self
            .sessions
            .iter()
            .filter(|e| e.value().read().is_expired())
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut removed = 0;
        for (client_id, session) in expired {
            if self.delete_session(&client_id, Some(&session)).await {
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} expired sessions", removed);
        }
        removed
    }

    /// Refuse new connections, then close every live connection with
    /// `reason_code` and wait for all of them, concurrently.
    pub async fn disconnect_all(&self, reason_code: ReasonCode) {
        let clients = {
            // a CONNECT past validation either finishes attaching before
            // this snapshot or sees the flag and is refused
            let _guard = self.connect_lock.lock().await;
            self.closing.store(true, Ordering::Release);
            self.clients()
        };
        if clients.is_empty() {
            return;
        }
        info!("Disconnecting {} clients", clients.len());
        let timeout = self.config.communication_timeout;
        join_all(clients.iter().map(|client| async move {
            client.request_disconnect(reason_code, ServerClose::Shutdown);
            if !client.wait_closed(timeout).await {
                warn!("Client {} did not close in time", client.client_id);
            }
        }))
        .await;
    }

    // ========================================================================
    // Publish
    // ========================================================================

    /// Route a message to every session with a matching subscription
    pub async fn dispatch_publish(
        &self,
        message: ApplicationMessage,
        sender: Option<Arc<str>>,
        session_items: Option<Arc<SessionItems>>,
    ) -> DispatchResult {
        let mut ctx = InterceptingPublish::new(message, sender.clone(), session_items);
        match self.events.hooks().intercept_publish(&mut ctx).await {
            Ok(()) => {}
            Err(HookError::Denied(reason_code)) => {
                ctx.reason_code = reason_code;
                ctx.process_publish = false;
            }
            Err(e) => warn!("Publish interceptor failed: {}", e),
        }

        let mut result = DispatchResult {
            reason_code: ctx.reason_code,
            close_connection: ctx.close_connection,
            reason_string: ctx.reason_string.take(),
            user_properties: std::mem::take(&mut ctx.user_properties),
            matching_subscribers: 0,
        };
        if ctx.is_aborted() {
            return result;
        }

        let message = ctx.message;
        if message.topic.is_empty() {
            result.reason_code = ReasonCode::TopicNameInvalid;
            return result;
        }

        if message.retain && self.config.retain_available {
            self.update_retained(&message, sender.clone()).await;
        }

        let topic_hash = TopicHash::calculate(&message.topic);
        let sessions: Vec<SharedSession> =
            self.sessions.iter().map(|e| e.value().clone()).collect();

        for session in sessions {
            let (receiver, matched) = {
                let s = session.read();
                if s.state == SessionState::Deleted || s.subscriptions.is_empty() {
                    continue;
                }
                let matched = s.subscriptions.check_subscriptions(
                    &message.topic,
                    &topic_hash,
                    message.qos,
                    sender.as_deref(),
                );
                (s.client_id.clone(), matched)
            };
            if !matched.is_subscribed {
                continue;
            }

            result.matching_subscribers += 1;
            let publish = message.to_publish(
                matched.qos,
                message.retain && matched.retain_as_published,
                &matched.subscription_identifiers,
            );
            if let Err(e) = self
                .enqueue_publish(&session, &receiver, sender.clone(), publish, None)
                .await
            {
                debug!("Message on {} not queued for {}: {}", message.topic, receiver, e);
            }
        }

        if result.matching_subscribers == 0 {
            if result.reason_code == ReasonCode::Success {
                result.reason_code = ReasonCode::NoMatchingSubscribers;
            }
            self.events
                .message_not_consumed(MessageNotConsumed {
                    sender_client_id: sender,
                    message,
                })
                .await;
        }
        result
    }

    /// Queue one copy of a message for one session, through the
    /// client-enqueue interceptor
    pub async fn enqueue_publish(
        &self,
        session: &SharedSession,
        receiver: &Arc<str>,
        sender: Option<Arc<str>>,
        publish: Publish,
        completion: Option<oneshot::Sender<DeliveryResult>>,
    ) -> Result<(), DeliveryError> {
        let mut ctx = InterceptingClientEnqueue {
            sender_client_id: sender.clone(),
            receiver_client_id: receiver.clone(),
            publish,
            accept_enqueue: true,
        };
        match self.events.hooks().intercept_client_enqueue(&mut ctx).await {
            Ok(()) => {}
            Err(HookError::Denied(_)) => ctx.accept_enqueue = false,
            Err(e) => warn!("Client enqueue interceptor failed: {}", e),
        }

        if !ctx.accept_enqueue {
            if let Some(tx) = completion {
                let _ = tx.send(Err(DeliveryError::Discarded));
            }
            self.events
                .message_enqueued_or_dropped(MessageEnqueuedOrDropped {
                    sender_client_id: sender,
                    receiver_client_id: receiver.clone(),
                    publish: ctx.publish,
                    dropped: true,
                })
                .await;
            return Err(DeliveryError::Discarded);
        }

        let mut pending = PendingMessage::new(ctx.publish.clone());
        if let Some(tx) = completion {
            pending = pending.with_completion(tx);
        }
        let outcome = session.write().enqueue(pending);

        let result = match outcome {
            Ok(Enqueued::Queued) => Ok(()),
            Ok(Enqueued::Evicted(evicted)) => {
                let overwritten = evicted.publish.clone();
                evicted.complete(Err(DeliveryError::Evicted));
                debug!("Pending queue of {} full, oldest message evicted", receiver);
                self.events
                    .queued_message_overwritten(QueuedMessageOverwritten {
                        receiver_client_id: receiver.clone(),
                        overwritten,
                    })
                    .await;
                Ok(())
            }
            Err(kind) => Err(DeliveryError::Overflow(kind)),
        };

        self.events
            .message_enqueued_or_dropped(MessageEnqueuedOrDropped {
                sender_client_id: sender,
                receiver_client_id: receiver.clone(),
                publish: ctx.publish,
                dropped: result.is_err(),
            })
            .await;
        result
    }

    // ========================================================================
    // Retained
    // ========================================================================

    async fn update_retained(&self, message: &ApplicationMessage, sender: Option<Arc<str>>) {
        let update = self.retained.set(message);
        if !update.is_change() {
            return;
        }

        if let Some(persistence) = self.persistence() {
            let topic = message.topic.to_string();
            let op = if message.payload.is_empty() {
                PersistenceOp::RemoveRetained { topic }
            } else {
                let retained = RetainedMessage::new(message.clone().with_retain(true));
                PersistenceOp::PutRetained {
                    topic,
                    message: StoredRetainedMessage::from(&retained),
                }
            };
            persistence.write(op);
        }

        self.events
            .retained_message_changed(RetainedMessageChanged {
                client_id: sender,
                changed: message.clone(),
                stored: self.retained.get_all(),
            })
            .await;
    }

    pub async fn clear_retained(&self) -> usize {
        let count = self.retained.clear();
        if let Some(persistence) = self.persistence() {
            persistence.write(PersistenceOp::ClearRetained);
        }
        self.events.retained_messages_cleared().await;
        count
    }

    /// Retained messages to replay for a new subscription
    fn retained_for(&self, filter: &str, granted: QoS, identifier: Option<u32>) -> Vec<Publish> {
        let ids: Vec<u32> = identifier.into_iter().collect();
        self.retained
            .get_all_matching(filter)
            .into_iter()
            .filter_map(|retained| {
                let remaining = retained.remaining_expiry()?;
                let qos = retained.message.qos.min(granted);
                let mut publish = retained.message.to_publish(qos, true, &ids);
                publish.properties.message_expiry_interval = remaining;
                Some(publish)
            })
            .collect()
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub async fn subscribe(
        &self,
        session: &SharedSession,
        filter: &str,
        options: SubscriptionOptions,
        identifier: Option<u32>,
    ) -> SubscribeOutcome {
        if topic::validate_topic_filter(filter).is_err() {
            return SubscribeOutcome::rejected(ReasonCode::TopicFilterInvalid);
        }
        if topic::is_shared_subscription(filter) {
            return SubscribeOutcome::rejected(ReasonCode::SharedSubscriptionsNotSupported);
        }
        if !self.config.wildcard_subscriptions && topic::has_wildcard(filter) {
            return SubscribeOutcome::rejected(ReasonCode::WildcardSubscriptionsNotSupported);
        }
        if identifier.is_some() && !self.config.subscription_identifiers {
            return SubscribeOutcome::rejected(ReasonCode::SubscriptionIdentifiersNotSupported);
        }

        let (client_id, items) = {
            let s = session.read();
            (s.client_id.clone(), s.items.clone())
        };
        let mut options = options;
        options.qos = options.qos.min(self.config.max_qos);

        let mut ctx = InterceptingSubscription {
            client_id: client_id.clone(),
            session_items: items.clone(),
            filter: filter.to_string(),
            options,
            identifier,
            process_subscription: true,
            close_connection: false,
            reason_code: options.qos.granted_reason(),
            reason_string: None,
        };
        match self.events.hooks().intercept_subscription(&mut ctx).await {
            Ok(()) => {}
            Err(HookError::Denied(reason_code)) => ctx.reason_code = reason_code,
            Err(e) => {
                warn!("Subscription interceptor failed for {}: {}", client_id, e);
                ctx.reason_code = ReasonCode::UnspecifiedError;
            }
        }

        if ctx.close_connection {
            return SubscribeOutcome {
                close_connection: true,
                ..SubscribeOutcome::rejected(ctx.reason_code)
            };
        }
        if ctx.is_aborted() {
            return SubscribeOutcome::rejected(ctx.reason_code);
        }
        if ctx.filter != filter && topic::validate_topic_filter(&ctx.filter).is_err() {
            warn!("Subscription interceptor produced invalid filter {:?}", ctx.filter);
            return SubscribeOutcome::rejected(ReasonCode::TopicFilterInvalid);
        }

        let mut options = ctx.options;
        options.qos = options.qos.min(self.config.max_qos);
        let subscription = Subscription::new(&ctx.filter, options, ctx.identifier);
        let filter = subscription.filter.clone();
        let is_new = session.write().subscriptions.insert(subscription).is_none();

        debug!("{} subscribed to {} (QoS {:?})", client_id, filter, options.qos);
        self.events
            .client_subscribed(ClientSubscribed {
                client_id,
                filter: filter.clone(),
                options,
                session_items: items,
            })
            .await;

        let replay = match options.retain_handling {
            RetainHandling::SendAtSubscribe => true,
            RetainHandling::SendIfNew => is_new,
            RetainHandling::DoNotSend => false,
        };
        let retained = if replay && self.config.retain_available {
            self.retained_for(&filter, options.qos, ctx.identifier)
        } else {
            Vec::new()
        };

        SubscribeOutcome {
            reason_code: ctx.reason_code,
            close_connection: false,
            retained,
        }
    }

    /// Remove one filter. Returns the UNSUBACK reason code and whether the
    /// interceptor asked to close the connection.
    pub async fn unsubscribe(&self, session: &SharedSession, filter: &str) -> (ReasonCode, bool) {
        if topic::validate_topic_filter(filter).is_err() {
            return (ReasonCode::TopicFilterInvalid, false);
        }

        let (client_id, items) = {
            let s = session.read();
            (s.client_id.clone(), s.items.clone())
        };
        let mut ctx = InterceptingUnsubscription {
            client_id: client_id.clone(),
            session_items: items.clone(),
            filter: filter.to_string(),
            process_unsubscription: true,
            close_connection: false,
            reason_code: ReasonCode::Success,
        };
        match self.events.hooks().intercept_unsubscription(&mut ctx).await {
            Ok(()) => {}
            Err(HookError::Denied(reason_code)) => ctx.reason_code = reason_code,
            Err(e) => {
                warn!("Unsubscription interceptor failed for {}: {}", client_id, e);
                ctx.reason_code = ReasonCode::UnspecifiedError;
            }
        }
        if ctx.is_aborted() {
            return (ctx.reason_code, ctx.close_connection);
        }

        let removed = session.write().subscriptions.remove(&ctx.filter).is_some();
        if !removed {
            return (ReasonCode::NoSubscriptionExisted, false);
        }

        debug!("{} unsubscribed from {}", client_id, ctx.filter);
        self.events
            .client_unsubscribed(ClientUnsubscribed {
                client_id,
                filter: ctx.filter,
                session_items: items,
            })
            .await;
        (ReasonCode::Success, false)
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    fn persist_session(&self, session: &SharedSession) -> bool {
        let Some(persistence) = self.persistence() else {
            return false;
        };
        let stored = {
            let s = session.read();
            if !s.is_persistent || s.state == SessionState::Deleted {
                return false;
            }
            StoredSession::from_session(&s)
        };
        persistence.write(PersistenceOp::PutSession {
            client_id: stored.client_id.clone(),
            session: stored,
        });
        true
    }

    /// Snapshot every detached persistent session
    pub fn persist_all(&self) -> usize {
        let mut count = 0;
        for (_, session) in self.sessions() {
            let detached = !session.read().is_connected();
            if detached && self.persist_session(&session) {
                count += 1;
            }
        }
        count
    }

    /// Load retained messages and detached sessions read at startup.
    /// Returns `(retained, sessions)` counts.
    ///
    /// Delayed wills are rescheduled for whatever is left of their delay.
    /// Expired sessions are dropped and their wills published.
    pub fn restore(self: &Arc<Self>, data: LoadedData) -> (usize, usize) {
        let retained = self
            .retained
            .load(data.retained.into_iter().map(|(_, m)| RetainedMessage::from(m)));

        let mut sessions = 0;
        for (client_id, stored) in data.sessions {
            let mut session = stored.into_session(
                self.config.max_pending_messages,
                self.config.overflow_strategy,
            );
            if session.is_expired() {
                debug!("Dropping expired stored session {}", client_id);
                if let Some(persistence) = self.persistence() {
                    persistence.write(PersistenceOp::RemoveSession { client_id });
                }
                if let Some(will) = session.will.take() {
                    let manager = Arc::clone(self);
                    let sender = session.client_id.clone();
                    tokio::spawn(async move {
                        debug!("Publishing will of expired session {}", sender);
                        manager.dispatch_publish(will, Some(sender), None).await;
                    });
                }
                continue;
            }

            let client_id = session.client_id.clone();
            let will_delay = session
                .will
                .as_ref()
                .map(|_| remaining_will_delay(&session));
            let shared = Arc::new(RwLock::new(session));
            self.sessions.insert(client_id.clone(), shared.clone());
            if let Some(delay) = will_delay {
                self.schedule_will(client_id, shared, delay);
            }
            sessions += 1;
        }
        (retained, sessions)
    }
}

/// What is left of a detached session's will delay, measured from its
/// disconnect time
fn remaining_will_delay(session: &Session) -> Duration {
    let delay = Duration::from_secs(u64::from(
        session.will_delay_interval.min(session.expiry_interval),
    ));
    let elapsed = session
        .disconnected_at
        .and_then(|at| at.elapsed().ok())
        .unwrap_or(Duration::ZERO);
    delay.saturating_sub(elapsed)
}
