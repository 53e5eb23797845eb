use thiserror::Error;

/// Main error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Database `{0}` is already open by another owner")]
    AlreadyOpen(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl StorageError {
    pub fn backend<T: ToString>(msg: T) -> Self {
        Self::Backend(msg.to_string())
    }

    pub fn configuration<T: ToString>(msg: T) -> Self {
        Self::Configuration(msg.to_string())
    }
}

pub(crate) fn map_redb_err<E: Into<redb::Error>>(e: E) -> StorageError {
    StorageError::backend(e.into())
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
