//! MQTT Broker Core
//!
//! The broker owns the sessions manager and runs one connection task per
//! accepted [`Transport`]. Listening sockets and the wire codec live with
//! the caller, which hands every new connection to [`Broker::accept`].

mod client;
mod connection;
mod events;
mod keepalive;
mod retained;
mod sessions;
mod transport;
mod writer;

pub use client::ClientStatus;
pub use connection::{Connection, ConnectionError};
pub use events::BrokerEvent;
pub use keepalive::KeepAlive;
pub use retained::{RetainedMessage, RetainedStore, RetainedUpdate};
pub use sessions::{DispatchResult, SessionStatus};
pub use transport::{
    ChannelPeer, ChannelReader, ChannelTransport, ChannelWriter, PacketReader, PacketWriter,
    Transport, TransportError,
};
pub use writer::{SendError, SharedWriter};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, Instrument};

use crate::hooks::{DefaultHooks, Hooks};
use crate::persistence::{PersistenceError, PersistenceManager, StorageBackend};
use crate::protocol::{ApplicationMessage, QoS, ReasonCode, SubscriptionOptions};
use crate::session::OverflowStrategy;
use crate::topic::validate_topic_name;
use events::EventHub;
use sessions::SessionsManager;

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Wait for CONNECT, for acknowledgements before a resend, and for a
    /// closing connection to finish
    pub communication_timeout: Duration,
    /// Resends of an unacknowledged message before the connection is closed
    pub max_retries: u32,
    /// Keep alive for v5 clients asking for 0 (0 = none)
    pub default_keep_alive: u16,
    /// Maximum keep alive
    pub max_keep_alive: u16,
    /// When false every session ends with its connection
    pub persistent_sessions: bool,
    /// Per-session pending queue capacity (0 = unbounded)
    pub max_pending_messages: usize,
    pub overflow_strategy: OverflowStrategy,
    /// Session expiry check interval
    pub expiry_check_interval: Duration,
    /// Per-client send quota (0 = the client's receive maximum)
    pub max_inflight: usize,
    /// Maximum QoS
    pub max_qos: QoS,
    /// Retain available
    pub retain_available: bool,
    /// Wildcard subscription available
    pub wildcard_subscriptions: bool,
    /// Subscription identifiers available
    pub subscription_identifiers: bool,
    /// Maximum inbound topic alias (0 = aliases disabled)
    pub max_topic_alias: u16,
    /// Broadcast channel capacity for [`BrokerEvent`]s
    pub event_capacity: usize,
    /// Persistence batching
    pub persistence_flush_interval: Duration,
    pub persistence_batch_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            communication_timeout: Duration::from_secs(10),
            max_retries: 3,
            default_keep_alive: 60,
            max_keep_alive: 65535,
            persistent_sessions: true,
            max_pending_messages: 250,
            overflow_strategy: OverflowStrategy::DropNewMessage,
            expiry_check_interval: Duration::from_secs(60),
            max_inflight: 0,
            max_qos: QoS::ExactlyOnce,
            retain_available: true,
            wildcard_subscriptions: true,
            subscription_identifiers: true,
            max_topic_alias: 65535,
            event_capacity: 1024,
            persistence_flush_interval: Duration::from_millis(100),
            persistence_batch_size: 100,
        }
    }
}

/// Management API errors
#[derive(Debug)]
pub enum BrokerError {
    ClientNotFound,
    SessionNotFound,
    InvalidTopic(&'static str),
    /// The broker is shutting down
    Shutdown,
    Persistence(PersistenceError),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::ClientNotFound => write!(f, "client not connected"),
            BrokerError::SessionNotFound => write!(f, "session not found"),
            BrokerError::InvalidTopic(reason) => write!(f, "invalid topic: {}", reason),
            BrokerError::Shutdown => write!(f, "broker is shutting down"),
            BrokerError::Persistence(e) => write!(f, "persistence error: {}", e),
        }
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BrokerError::Persistence(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PersistenceError> for BrokerError {
    fn from(e: PersistenceError) -> Self {
        BrokerError::Persistence(e)
    }
}

/// The MQTT Broker
pub struct Broker {
    manager: Arc<SessionsManager>,
    persistence: Option<Arc<PersistenceManager>>,
    /// Stops connections still waiting for CONNECT, and the expiry sweep
    shutdown: broadcast::Sender<()>,
    shutting_down: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    /// Create a new broker with default hooks (allows everything)
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_hooks(config, Arc::new(DefaultHooks))
    }

    /// Create a new broker with custom hooks
    pub fn with_hooks(config: BrokerConfig, hooks: Arc<dyn Hooks>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let events = EventHub::new(hooks, config.event_capacity);
        Self {
            manager: Arc::new(SessionsManager::new(Arc::new(config), events)),
            persistence: None,
            shutdown,
            shutting_down: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        }
    }

    /// Store retained messages and persistent sessions in `backend`.
    ///
    /// Spawns the background writer, so it must be called inside a Tokio
    /// runtime. Stored state is loaded by [`start`](Self::start).
    pub fn with_persistence(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        let config = self.manager.config();
        let persistence = Arc::new(PersistenceManager::new(
            backend,
            config.persistence_flush_interval,
            config.persistence_batch_size,
        ));
        self.manager.set_persistence(persistence.clone());
        self.persistence = Some(persistence);
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        self.manager.config()
    }

    /// Load persisted state, start the session expiry sweep and fire
    /// `on_started`
    pub async fn start(&self) -> Result<(), BrokerError> {
        if let Some(persistence) = &self.persistence {
            let data = persistence.load_all().await?;
            let (retained, sessions) = self.manager.restore(data);
            info!(
                "Restored {} retained messages and {} sessions",
                retained, sessions
            );
        }

        self.spawn_expiry_sweep();
        self.manager.events().started().await;
        info!("Broker started");
        Ok(())
    }

    fn spawn_expiry_sweep(&self) {
        let interval = self.manager.config().expiry_check_interval;
        if interval.is_zero() {
            return;
        }
        let manager = self.manager.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    biased;

                    result = shutdown_rx.recv() => {
                        match result {
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            _ => break,
                        }
                    }
                    _ = ticker.tick() => {
                        let removed = manager.remove_expired_sessions().await;
                        if removed > 0 {
                            debug!("Removed {} expired sessions", removed);
                        }
                    }
                }
            }
        });
        if let Some(previous) = self.sweeper.lock().replace(task) {
            previous.abort();
        }
    }

    /// Run a connection on `transport` until it closes.
    ///
    /// The task resolves with the connection's outcome; a refused CONNECT or
    /// a protocol violation is reported there, not here.
    pub fn accept<T: Transport>(
        &self,
        transport: T,
    ) -> Result<JoinHandle<Result<(), ConnectionError>>, BrokerError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(BrokerError::Shutdown);
        }

        let endpoint = transport.endpoint();
        debug!("New connection from {}", endpoint);
        let span = info_span!("client", endpoint = %endpoint, client_id = tracing::field::Empty);
        let connection = Connection::new(transport, self.manager.clone(), self.shutdown.subscribe());

        Ok(tokio::spawn(
            async move {
                let result = connection.run().await;
                if let Err(e) = &result {
                    debug!("Connection ended: {}", e);
                }
                result
            }
            .instrument(span),
        ))
    }

    /// Subscribe to broker events
    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.manager.events().subscribe()
    }

    /// Every session, connected or not
    pub fn sessions(&self) -> Vec<SessionStatus> {
        self.manager
            .sessions()
            .into_iter()
            .map(|(client_id, session)| SessionStatus::new(client_id, session, self.manager.clone()))
            .collect()
    }

    pub fn session(&self, client_id: &str) -> Option<SessionStatus> {
        let session = self.manager.session(client_id)?;
        let client_id = session.read().client_id.clone();
        Some(SessionStatus::new(client_id, session, self.manager.clone()))
    }

    /// Every live connection
    pub fn clients(&self) -> Vec<ClientStatus> {
        let timeout = self.manager.config().communication_timeout;
        self.manager
            .clients()
            .into_iter()
            .map(|handle| ClientStatus::new(handle, timeout))
            .collect()
    }

    pub fn client(&self, client_id: &str) -> Option<ClientStatus> {
        let timeout = self.manager.config().communication_timeout;
        self.manager
            .client(client_id)
            .map(|handle| ClientStatus::new(handle, timeout))
    }

    pub fn retained_messages(&self) -> Vec<ApplicationMessage> {
        self.manager.retained().get_all()
    }

    /// Drop every retained message. Returns how many were dropped.
    pub async fn clear_retained(&self) -> usize {
        self.manager.clear_retained().await
    }

    /// Close a client's connection with `reason_code` (v5) and wait for it
    /// to finish. The will message is published.
    pub async fn disconnect_client(
        &self,
        client_id: &str,
        reason_code: ReasonCode,
    ) -> Result<(), BrokerError> {
        let client = self.client(client_id).ok_or(BrokerError::ClientNotFound)?;
        client.disconnect(reason_code).await;
        Ok(())
    }

    /// Publish a message on behalf of the server, through the same
    /// interception and routing as a client PUBLISH
    pub async fn inject_application_message(
        &self,
        message: ApplicationMessage,
    ) -> Result<DispatchResult, BrokerError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(BrokerError::Shutdown);
        }
        validate_topic_name(&message.topic).map_err(BrokerError::InvalidTopic)?;
        Ok(self.manager.dispatch_publish(message, None, None).await)
    }

    /// Subscribe a session to `filter` as if its client had sent SUBSCRIBE.
    /// Retained messages are replayed per `options.retain_handling`.
    pub async fn subscribe(
        &self,
        client_id: &str,
        filter: &str,
        options: SubscriptionOptions,
    ) -> Result<ReasonCode, BrokerError> {
        let session = self
            .manager
            .session(client_id)
            .ok_or(BrokerError::SessionNotFound)?;
        let outcome = self.manager.subscribe(&session, filter, options, None).await;

        let receiver = session.read().client_id.clone();
        for publish in outcome.retained {
            if let Err(e) = self
                .manager
                .enqueue_publish(&session, &receiver, None, publish, None)
                .await
            {
                debug!("Retained message not queued for {}: {}", receiver, e);
            }
        }
        Ok(outcome.reason_code)
    }

    pub async fn unsubscribe(&self, client_id: &str, filter: &str) -> Result<ReasonCode, BrokerError> {
        let session = self
            .manager
            .session(client_id)
            .ok_or(BrokerError::SessionNotFound)?;
        let (reason_code, _) = self.manager.unsubscribe(&session, filter).await;
        Ok(reason_code)
    }

    /// Stop accepting connections, close every client with
    /// `ServerShuttingDown`, flush persistence and fire `on_stopped`
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down broker");

        let _ = self.shutdown.send(());
        self.manager
            .disconnect_all(ReasonCode::ServerShuttingDown)
            .await;

        let sweeper = self.sweeper.lock().take();
        if let Some(task) = sweeper {
            let _ = task.await;
        }

        if let Some(persistence) = &self.persistence {
            let persisted = self.manager.persist_all();
            debug!("Persisted {} sessions", persisted);
            if let Err(e) = persistence.shutdown().await {
                error!("Persistence shutdown failed: {}", e);
            }
        }

        self.manager.events().stopped().await;
        info!("Broker stopped");
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
