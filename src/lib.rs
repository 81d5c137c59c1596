//! mqtt-engine - MQTT v3.1/v3.1.1/v5.0 broker engine
//!
//! The protocol-level core of an MQTT broker: sessions, subscription
//! matching, retained messages, QoS flows, keep-alive, wills and the
//! interception hooks around them. Byte encoding and sockets are left to
//! the embedding application, which hands decoded packets to the engine
//! through the [`broker::Transport`] trait.

pub mod broker;
pub mod config;
pub mod hooks;
pub mod logging;
pub mod persistence;
pub mod protocol;
pub mod session;
pub mod topic;

pub use broker::{Broker, BrokerConfig, BrokerError, BrokerEvent};
pub use config::Config;
pub use hooks::{CompositeHooks, DefaultHooks, Hooks};
pub use persistence::{FileBackend, MemoryBackend, PersistenceManager, StorageBackend};
pub use protocol::{ProtocolVersion, QoS};
