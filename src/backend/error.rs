use std::io;

/// Errors reported by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {message} ({source})")]
    Io {
        message: String,
        #[source]
        source: io::Error,
    },
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Key not found: {0}")]
    NotFound(String),
    #[error("Lock error: {0}")]
    Lock(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Error: {0}")]
    Other(String),
}

impl StorageError {
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        StorageError::Io {
            message: message.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}
