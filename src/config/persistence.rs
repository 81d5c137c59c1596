//! `[persistence]` section

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::persistence::{FileBackend, MemoryBackend, PersistenceError, StorageBackend};

/// Where retained messages and sessions are kept
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Process-local, lost on exit
    #[default]
    Memory,
    /// Single snapshot file at `path`
    File,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub backend: BackendType,
    /// Snapshot location, file backend only
    pub path: PathBuf,
    /// Longest time a queued write waits before it is committed
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Queued writes that force an early commit
    pub max_batch_size: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: BackendType::Memory,
            path: PathBuf::from("./data/mqtt-engine.snapshot"),
            flush_interval: Duration::from_millis(100),
            max_batch_size: 100,
        }
    }
}

impl PersistenceConfig {
    /// `None` when persistence is disabled
    pub fn open_backend(&self) -> Result<Option<Arc<dyn StorageBackend>>, PersistenceError> {
        if !self.enabled {
            return Ok(None);
        }
        let backend: Arc<dyn StorageBackend> = match self.backend {
            BackendType::Memory => Arc::new(MemoryBackend::new()),
            BackendType::File => Arc::new(FileBackend::open(&self.path)?),
        };
        Ok(Some(backend))
    }
}
