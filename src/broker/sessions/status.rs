use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::oneshot;

use super::{SessionsManager, SharedSession};
use crate::protocol::{ApplicationMessage, Publish};
use crate::session::{DeliveryError, DeliveryResult, SessionItems};

/// Management view of one session, connected or not
#[derive(Clone)]
pub struct SessionStatus {
    client_id: Arc<str>,
    session: SharedSession,
    manager: Arc<SessionsManager>,
}

impl SessionStatus {
    pub(crate) fn new(client_id: Arc<str>, session: SharedSession, manager: Arc<SessionsManager>) -> Self {
        Self {
            client_id,
            session,
            manager,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn pending_count(&self) -> usize {
        self.session.read().pending.len()
    }

    pub fn inflight_count(&self) -> usize {
        self.session.read().inflight.len()
    }

    pub fn items(&self) -> Arc<SessionItems> {
        self.session.read().items.clone()
    }

    /// Subscribed filters, sorted
    pub fn subscriptions(&self) -> Vec<String> {
        let mut filters: Vec<String> = self
            .session
            .read()
            .subscriptions
            .iter()
            .map(|s| s.filter.to_string())
            .collect();
        filters.sort();
        filters
    }

    pub fn is_connected(&self) -> bool {
        self.session.read().is_connected()
    }

    pub fn is_persistent(&self) -> bool {
        self.session.read().is_persistent
    }

    pub fn created_at(&self) -> SystemTime {
        self.session.read().created_at
    }

    pub fn expiry_interval(&self) -> u32 {
        self.session.read().expiry_interval
    }

    /// Queue a message directly for this session, without subscription
    /// matching. Fails when the queue is full with `DropNewMessage`.
    pub async fn try_enqueue(&self, message: ApplicationMessage) -> Result<(), DeliveryError> {
        let publish = self.direct_publish(&message);
        self.manager
            .enqueue_publish(&self.session, &self.client_id, None, publish, None)
            .await
    }

    /// Queue a message directly and wait until it has been written to the
    /// client, dropped, or `timeout` elapsed.
    pub async fn deliver_and_wait(
        &self,
        message: ApplicationMessage,
        timeout: Duration,
    ) -> DeliveryResult {
        let (tx, rx) = oneshot::channel();
        let publish = self.direct_publish(&message);
        self.manager
            .enqueue_publish(&self.session, &self.client_id, None, publish, Some(tx))
            .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // completion dropped unsignalled
            Ok(Err(_)) => Err(DeliveryError::Discarded),
            Err(_) => Err(DeliveryError::Timeout),
        }
    }

    /// Drop every queued message. Returns how many were dropped.
    pub fn clear_pending(&self) -> usize {
        self.session.write().clear_pending()
    }

    /// Delete the session, closing its connection first if there is one
    pub async fn delete(&self) -> bool {
        self.manager.remove_session(&self.client_id).await
    }

    fn direct_publish(&self, message: &ApplicationMessage) -> Publish {
        let qos = message.qos.min(self.manager.config().max_qos);
        message.to_publish(qos, message.retain, &[])
    }
}

impl std::fmt::Debug for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStatus")
            .field("client_id", &self.client_id)
            .field("session", &*self.session.read())
            .finish()
    }
}
