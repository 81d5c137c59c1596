//! Broker events
//!
//! Every lifecycle event is delivered twice: to the [`Hooks`] callbacks,
//! in order and awaited, and as a [`BrokerEvent`] on a broadcast channel
//! for observers that only watch.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::hooks::{
    ClientAcknowledged, ClientConnected, ClientDisconnected, ClientSubscribed, ClientUnsubscribed,
    Hooks, MessageEnqueuedOrDropped, MessageNotConsumed, QueuedMessageOverwritten,
    RetainedMessageChanged, SessionDeleted,
};

#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Started,
    Stopped,
    ClientConnected(ClientConnected),
    ClientDisconnected(ClientDisconnected),
    ClientSubscribed(ClientSubscribed),
    ClientUnsubscribed(ClientUnsubscribed),
    ClientAcknowledged(ClientAcknowledged),
    MessageNotConsumed(MessageNotConsumed),
    MessageEnqueuedOrDropped(MessageEnqueuedOrDropped),
    QueuedMessageOverwritten(QueuedMessageOverwritten),
    RetainedMessageChanged(RetainedMessageChanged),
    RetainedMessagesCleared,
    SessionDeleted(SessionDeleted),
}

/// Fans events out to the hooks and the broadcast channel
#[derive(Clone)]
pub(crate) struct EventHub {
    hooks: Arc<dyn Hooks>,
    tx: broadcast::Sender<BrokerEvent>,
}

impl EventHub {
    pub fn new(hooks: Arc<dyn Hooks>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { hooks, tx }
    }

    pub fn hooks(&self) -> &Arc<dyn Hooks> {
        &self.hooks
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.tx.subscribe()
    }

    fn broadcast(&self, event: BrokerEvent) {
        // no receivers is fine
        let _ = self.tx.send(event);
    }

    pub async fn started(&self) {
        self.hooks.on_started().await;
        self.broadcast(BrokerEvent::Started);
    }

    pub async fn stopped(&self) {
        self.hooks.on_stopped().await;
        self.broadcast(BrokerEvent::Stopped);
    }

    pub async fn client_connected(&self, event: ClientConnected) {
        self.hooks.on_client_connected(&event).await;
        self.broadcast(BrokerEvent::ClientConnected(event));
    }

    pub async fn client_disconnected(&self, event: ClientDisconnected) {
        self.hooks.on_client_disconnected(&event).await;
        self.broadcast(BrokerEvent::ClientDisconnected(event));
    }

    pub async fn client_subscribed(&self, event: ClientSubscribed) {
        self.hooks.on_client_subscribed(&event).await;
        self.broadcast(BrokerEvent::ClientSubscribed(event));
    }

    pub async fn client_unsubscribed(&self, event: ClientUnsubscribed) {
        self.hooks.on_client_unsubscribed(&event).await;
        self.broadcast(BrokerEvent::ClientUnsubscribed(event));
    }

    pub async fn client_acknowledged(&self, event: ClientAcknowledged) {
        self.hooks.on_client_acknowledged(&event).await;
        self.broadcast(BrokerEvent::ClientAcknowledged(event));
    }

    pub async fn message_not_consumed(&self, event: MessageNotConsumed) {
        self.hooks.on_message_not_consumed(&event).await;
        self.broadcast(BrokerEvent::MessageNotConsumed(event));
    }

    pub async fn message_enqueued_or_dropped(&self, event: MessageEnqueuedOrDropped) {
        self.hooks.on_message_enqueued_or_dropped(&event).await;
        self.broadcast(BrokerEvent::MessageEnqueuedOrDropped(event));
    }

    pub async fn queued_message_overwritten(&self, event: QueuedMessageOverwritten) {
        self.hooks.on_queued_message_overwritten(&event).await;
        self.broadcast(BrokerEvent::QueuedMessageOverwritten(event));
    }

    pub async fn retained_message_changed(&self, event: RetainedMessageChanged) {
        self.hooks.on_retained_message_changed(&event).await;
        self.broadcast(BrokerEvent::RetainedMessageChanged(event));
    }

    pub async fn retained_messages_cleared(&self) {
        self.hooks.on_retained_messages_cleared().await;
        self.broadcast(BrokerEvent::RetainedMessagesCleared);
    }

    pub async fn session_deleted(&self, event: SessionDeleted) {
        self.hooks.on_session_deleted(&event).await;
        self.broadcast(BrokerEvent::SessionDeleted(event));
    }
}
