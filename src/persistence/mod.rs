//! Persistence module.
//!
//! Provides durable storage for:
//! - Retained messages
//! - Persistent sessions (subscriptions, queued messages, will)
//!
//! Writes leave the broker's hot path through [`PersistenceManager`], which
//! batches them for a [`StorageBackend`]. Two backends ship with the crate:
//! - `MemoryBackend` - process-local, for tests and embedding
//! - `FileBackend` - one bincode snapshot file

mod backend;
mod error;
mod file;
mod memory;
mod models;

pub use backend::{PersistenceOp, StorageBackend};
pub use error::{PersistenceError, Result};
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use models::{
    LoadedData, StoredInflightMessage, StoredPendingMessage, StoredProperties, StoredPublish,
    StoredRetainedMessage, StoredSession, StoredSubscription, StoredWillMessage,
};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Queued writes before new ones are dropped
const QUEUE_CAPACITY: usize = 10_000;

/// Batches writes from the broker and hands them to the backend
pub struct PersistenceManager {
    backend: Arc<dyn StorageBackend>,
    /// Taken on shutdown, which ends the writer task
    tx: Mutex<Option<mpsc::Sender<PersistenceOp>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl PersistenceManager {
    /// Spawns the batching writer, so it must run inside a Tokio runtime.
    /// A batch is committed every `flush_interval` or once it holds
    /// `max_batch_size` writes.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        flush_interval: Duration,
        max_batch_size: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let writer = BatchWriter {
            backend: backend.clone(),
            batch: Vec::new(),
            max_batch_size: max_batch_size.max(1),
        };
        let task = tokio::spawn(writer.run(rx, flush_interval));

        Self {
            backend,
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(task)),
        }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Queue a write without waiting. Dropped with a warning when the queue
    /// is full or the manager was shut down.
    pub fn write(&self, op: PersistenceOp) {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            debug!("Persistence stopped, dropping write");
            return;
        };
        if let Err(e) = tx.try_send(op) {
            warn!("Persistence queue full, dropping write: {}", e);
        }
    }

    pub async fn load_all(&self) -> Result<LoadedData> {
        self.backend.load().await
    }

    /// Commit everything queued so far and flush the backend
    pub async fn shutdown(&self) -> Result<()> {
        // closing the channel lets the writer drain it and exit
        drop(self.tx.lock().take());
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                error!("Persistence writer task failed: {}", e);
            }
        }

        self.backend.flush().await?;
        info!("Persistence flushed");
        Ok(())
    }
}

struct BatchWriter {
    backend: Arc<dyn StorageBackend>,
    batch: Vec<PersistenceOp>,
    max_batch_size: usize,
}

impl BatchWriter {
    async fn run(mut self, mut rx: mpsc::Receiver<PersistenceOp>, flush_interval: Duration) {
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                op = rx.recv() => match op {
                    Some(op) => {
                        self.batch.push(op);
                        if self.batch.len() >= self.max_batch_size {
                            self.commit().await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => self.commit().await,
            }
        }

        self.commit().await;
        debug!("Persistence writer stopped");
    }

    async fn commit(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let ops = std::mem::take(&mut self.batch);
        let count = ops.len();
        match self.backend.apply(ops).await {
            Ok(()) => debug!("Committed {} persistence writes", count),
            Err(e) => error!("Failed to commit {} persistence writes: {}", count, e),
        }
    }
}

#[cfg(test)]
mod tests;
