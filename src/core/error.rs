use thiserror::Error;

/// Failures of the local durable store.
///
/// Always surfaced to the caller of the operation that hit them; the store
/// never retries internally.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StorageFault {
    #[error("Store is not open")]
    NotOpen,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Record '{id}' already exists in '{collection}'")]
    DuplicateKey { collection: String, id: String },

    #[error("Record '{id}' not found in '{collection}'")]
    NotFound { collection: String, id: String },

    #[error("Index '{index}' is not defined on '{collection}'")]
    UnknownIndex { collection: String, index: String },

    #[error("Corrupted store data: {0}")]
    Corrupted(String),

    #[error("Lock error: {0}")]
    LockError(String),
}

/// Failures reported by the remote dispatch seam.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchFault {
    #[error("Remote unreachable: {0}")]
    Unreachable(String),

    #[error("Remote rejected entry (status {status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("Failed to encode entry: {0}")]
    Encoding(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageFault),

    #[error(transparent)]
    Dispatch(#[from] DispatchFault),

    #[error("Invalid record: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl<T> From<std::sync::PoisonError<T>> for StorageFault {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<std::io::Error> for StorageFault {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageFault {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
