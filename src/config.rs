use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Error reading config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Couldn't parse config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Config {} must contain a JSON object", .path.display())]
    NotObject { path: PathBuf },
    #[error("Key 'storage' not found in {}", .path.display())]
    MissingStorage { path: PathBuf },
}

/// Reads the backend configuration out of a JSON file of the form
/// `{"storage": {...}}`.
///
/// Returns the serialized `storage` value, or an empty buffer when no file
/// was given.
pub fn load_storage_config(path: Option<&Path>) -> Result<Vec<u8>, ConfigError> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };

    let data = fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_error = |source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    };

    let value: serde_json::Value = serde_json::from_slice(&data).map_err(parse_error)?;
    let serde_json::Value::Object(mut config) = value else {
        return Err(ConfigError::NotObject {
            path: path.to_path_buf(),
        });
    };
    let storage = config
        .remove("storage")
        .filter(|v| !v.is_null())
        .ok_or_else(|| ConfigError::MissingStorage {
            path: path.to_path_buf(),
        })?;
    serde_json::to_vec(&storage).map_err(parse_error)
}
