use thiserror::Error;

use fleetdesk_core::{BackendError, FrameError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("journal io error: {0}")]
    Journal(#[from] std::io::Error),
    #[error("journal frame error: {0}")]
    Frame(#[from] FrameError),
}

impl From<StoreError> for BackendError {
    fn from(err: StoreError) -> Self {
        BackendError::Storage(err.to_string())
    }
}
