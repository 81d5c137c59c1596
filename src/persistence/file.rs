//! Single-file snapshot backend.
//!
//! The state is held in memory. Each flush writes the complete state as one
//! bincode snapshot to a temporary file and renames it over the previous
//! one, so a crash leaves either the old or the new snapshot on disk.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bincode::{Decode, Encode};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::backend::{PersistenceOp, StorageBackend};
use super::error::{PersistenceError, Result};
use super::memory::Tables;
use super::models::{LoadedData, StoredRetainedMessage, StoredSession};

const MAGIC: [u8; 4] = *b"MQES";
const FORMAT_VERSION: u16 = 1;

#[derive(Encode, Decode)]
struct Snapshot {
    magic: [u8; 4],
    version: u16,
    retained: Vec<(String, StoredRetainedMessage)>,
    sessions: Vec<(String, StoredSession)>,
}

struct State {
    tables: Tables,
    /// Batches applied since the last snapshot
    unsaved: usize,
}

pub struct FileBackend {
    path: PathBuf,
    state: Mutex<State>,
    /// One snapshot write at a time
    save_lock: tokio::sync::Mutex<()>,
}

impl FileBackend {
    /// Open the snapshot at `path`. A missing file is an empty state.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = match std::fs::read(&path) {
            Ok(bytes) => decode(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(
            "Opened snapshot {} ({} retained, {} sessions)",
            path.display(),
            tables.retained.len(),
            tables.sessions.len()
        );

        Ok(Self {
            path,
            state: Mutex::new(State { tables, unsaved: 0 }),
            save_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self) -> Result<()> {
        let _guard = self.save_lock.lock().await;
        let bytes = {
            let mut state = self.state.lock();
            if state.unsaved == 0 {
                return Ok(());
            }
            let bytes = encode(&state.tables)?;
            state.unsaved = 0;
            bytes
        };

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        trace!("Wrote snapshot {} ({} bytes)", self.path.display(), bytes.len());
        Ok(())
    }
}

fn encode(tables: &Tables) -> Result<Vec<u8>> {
    let loaded = tables.to_loaded();
    let snapshot = Snapshot {
        magic: MAGIC,
        version: FORMAT_VERSION,
        retained: loaded.retained,
        sessions: loaded.sessions,
    };
    Ok(bincode::encode_to_vec(&snapshot, bincode::config::standard())?)
}

fn decode(bytes: &[u8]) -> Result<Tables> {
    if !bytes.starts_with(&MAGIC) {
        return Err(PersistenceError::Deserialize("not a snapshot file".into()));
    }
    let (snapshot, _): (Snapshot, usize) =
        bincode::decode_from_slice(bytes, bincode::config::standard())?;
    if snapshot.version != FORMAT_VERSION {
        return Err(PersistenceError::Deserialize(format!(
            "snapshot format {} is not supported",
            snapshot.version
        )));
    }
    Ok(Tables {
        retained: snapshot.retained.into_iter().collect(),
        sessions: snapshot.sessions.into_iter().collect(),
    })
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn load(&self) -> Result<LoadedData> {
        Ok(self.state.lock().tables.to_loaded())
    }

    async fn apply(&self, ops: Vec<PersistenceOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.state.lock();
            for op in ops {
                state.tables.apply(op);
            }
            state.unsaved += 1;
        }
        self.save().await
    }

    async fn flush(&self) -> Result<()> {
        self.save().await
    }
}
