use std::path::{self, Component, Path, PathBuf};

use log::{debug, info};

use crate::backend::Storage;
use crate::error::MigrateError;
use crate::operations::TransferStats;
use crate::utils;

/// Writes every key in `storage` to a file below `dest`, creating
/// directories for the key's segments and overwriting existing files.
pub fn export_files(storage: &dyn Storage, dest: impl AsRef<Path>) -> Result<TransferStats, MigrateError> {
    let dest = dest.as_ref();
    let dest = path::absolute(dest).map_err(|e| MigrateError::fs("Failed to resolve", dest, e))?;

    let keys = storage.list("", true).map_err(|e| MigrateError::storage("", e))?;
    debug!("Exporting {} keys from {} storage", keys.len(), storage.name());

    utils::create_private_dir_all(&dest)
        .map_err(|e| MigrateError::fs("Failed to create directory", &dest, e))?;

    let mut stats = TransferStats::default();
    for key in keys {
        info!("Exporting {}...", key);
        let value = storage.load(&key).map_err(|e| MigrateError::storage(&key, e))?;

        let path = destination_path(&dest, &key)?;
        if let Some(parent) = path.parent() {
            utils::create_private_dir_all(parent)
                .map_err(|e| MigrateError::fs("Failed to create directory", parent, e))?;
        }
        utils::write_private(&path, &value).map_err(|e| MigrateError::fs("Failed to write", &path, e))?;
        stats.record(value.len());
    }

    Ok(stats)
}

/// Maps `key` below `dest`. Both `/` and `\` separate segments; segments
/// that would leave `dest` are rejected.
fn destination_path(dest: &Path, key: &str) -> Result<PathBuf, MigrateError> {
    let mut path = dest.to_path_buf();
    let mut segments = 0;
    for segment in key.split(['/', '\\']).filter(|s| !s.is_empty()) {
        let mut components = Path::new(segment).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => path.push(segment),
            _ => return Err(MigrateError::InvalidKey(key.to_string())),
        }
        segments += 1;
    }
    if segments == 0 {
        return Err(MigrateError::InvalidKey(key.to_string()));
    }
    Ok(path)
}
