use std::io;
use std::path::PathBuf;

use crate::backend::StorageError;
use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error("Storage '{0}' not found")]
    BackendNotFound(String),
    #[error("Storage '{0}' is already registered")]
    DuplicateBackend(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Couldn't parse storage config: {0}")]
    ConfigParse(#[source] serde_json::Error),
    #[error("Error during provision of '{name}': {source}")]
    Provision {
        name: String,
        #[source]
        source: StorageError,
    },
    #[error("Error during validation of '{name}': {source}")]
    Validation {
        name: String,
        #[source]
        source: StorageError,
    },
    #[error("{message} {}: {source}", .path.display())]
    Filesystem {
        message: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Storage error on '{key}': {source}")]
    Storage {
        key: String,
        #[source]
        source: StorageError,
    },
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("Checksum mismatch for '{key}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },
}

impl MigrateError {
    pub(crate) fn fs(message: impl Into<String>, path: impl Into<PathBuf>, source: io::Error) -> Self {
        MigrateError::Filesystem {
            message: message.into(),
            path: path.into(),
            source,
        }
    }

    pub(crate) fn storage(key: impl Into<String>, source: StorageError) -> Self {
        MigrateError::Storage {
            key: key.into(),
            source,
        }
    }
}
