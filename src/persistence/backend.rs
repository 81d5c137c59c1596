//! Storage backend trait.
//!
//! The engine never reads individual records back while running: it loads
//! everything once at start and afterwards only streams writes. Backends
//! therefore implement a bulk load and an ordered batch apply.

use async_trait::async_trait;

use super::error::Result;
use super::models::{LoadedData, StoredRetainedMessage, StoredSession};

/// One write, as queued by [`PersistenceManager`](super::PersistenceManager)
#[derive(Debug, Clone)]
pub enum PersistenceOp {
    PutRetained {
        topic: String,
        message: StoredRetainedMessage,
    },
    RemoveRetained {
        topic: String,
    },
    ClearRetained,
    PutSession {
        client_id: String,
        session: StoredSession,
    },
    RemoveSession {
        client_id: String,
    },
}

/// Where retained messages and persistent sessions are kept
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Everything stored, read once when the broker starts
    async fn load(&self) -> Result<LoadedData>;

    /// Apply `ops` in order. A backend that can should make the batch
    /// atomic.
    async fn apply(&self, ops: Vec<PersistenceOp>) -> Result<()>;

    /// Make every applied batch durable. Called once more on shutdown.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
