//! In-memory storage backend

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::backend::{PersistenceOp, StorageBackend};
use super::error::Result;
use super::models::{LoadedData, StoredRetainedMessage, StoredSession};

/// Stored state keyed by topic and client id
#[derive(Debug, Clone, Default)]
pub(crate) struct Tables {
    pub retained: BTreeMap<String, StoredRetainedMessage>,
    pub sessions: BTreeMap<String, StoredSession>,
}

impl Tables {
    pub fn apply(&mut self, op: PersistenceOp) {
        match op {
            PersistenceOp::PutRetained { topic, message } => {
                self.retained.insert(topic, message);
            }
            PersistenceOp::RemoveRetained { topic } => {
                self.retained.remove(&topic);
            }
            PersistenceOp::ClearRetained => self.retained.clear(),
            PersistenceOp::PutSession { client_id, session } => {
                self.sessions.insert(client_id, session);
            }
            PersistenceOp::RemoveSession { client_id } => {
                self.sessions.remove(&client_id);
            }
        }
    }

    pub fn to_loaded(&self) -> LoadedData {
        LoadedData {
            retained: self
                .retained
                .iter()
                .map(|(topic, m)| (topic.clone(), m.clone()))
                .collect(),
            sessions: self
                .sessions
                .iter()
                .map(|(client_id, s)| (client_id.clone(), s.clone()))
                .collect(),
        }
    }
}

/// Non-durable backend, lost with the process
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retained_len(&self) -> usize {
        self.tables.read().retained.len()
    }

    pub fn sessions_len(&self) -> usize {
        self.tables.read().sessions.len()
    }

    pub fn session(&self, client_id: &str) -> Option<StoredSession> {
        self.tables.read().sessions.get(client_id).cloned()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn load(&self) -> Result<LoadedData> {
        Ok(self.tables.read().to_loaded())
    }

    async fn apply(&self, ops: Vec<PersistenceOp>) -> Result<()> {
        let mut tables = self.tables.write();
        for op in ops {
            tables.apply(op);
        }
        Ok(())
    }
}
