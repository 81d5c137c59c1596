use std::fmt;

/// Persistence failure
#[derive(Debug)]
pub enum PersistenceError {
    Io(std::io::Error),
    /// A record could not be encoded
    Serialize(bincode::error::EncodeError),
    /// Stored bytes that do not decode, or a file that is not a snapshot
    Deserialize(String),
    /// Reported by an external backend
    Storage(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::Io(e) => write!(f, "persistence I/O failed: {}", e),
            PersistenceError::Serialize(e) => write!(f, "cannot encode record: {}", e),
            PersistenceError::Deserialize(msg) => write!(f, "cannot decode stored data: {}", msg),
            PersistenceError::Storage(msg) => write!(f, "storage backend: {}", msg),
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PersistenceError::Io(e) => Some(e),
            PersistenceError::Serialize(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(e: std::io::Error) -> Self {
        PersistenceError::Io(e)
    }
}

impl From<bincode::error::EncodeError> for PersistenceError {
    fn from(e: bincode::error::EncodeError) -> Self {
        PersistenceError::Serialize(e)
    }
}

impl From<bincode::error::DecodeError> for PersistenceError {
    fn from(e: bincode::error::DecodeError) -> Self {
        PersistenceError::Deserialize(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
