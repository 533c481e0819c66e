use std::fs;
use std::path::{self, Path, PathBuf, MAIN_SEPARATOR};

use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::backend::Storage;
use crate::error::MigrateError;
use crate::operations::TransferStats;
use crate::utils;

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Load every key back after storing it and compare SHA-256 digests.
    pub verify: bool,
}

/// Copies every file below `root` into `storage`.
///
/// A file's key is its path with `root` stripped, leading separator kept:
/// `root/certificates/a.crt` becomes `/certificates/a.crt`.
pub fn import_files(storage: &dyn Storage, root: impl AsRef<Path>) -> Result<TransferStats, MigrateError> {
    import_files_with_options(storage, root, &ImportOptions::default())
}

pub fn import_files_with_options(
    storage: &dyn Storage,
    root: impl AsRef<Path>,
    opts: &ImportOptions,
) -> Result<TransferStats, MigrateError> {
    let root = root.as_ref();
    let root = path::absolute(root)
        .map_err(|e| MigrateError::fs("Failed to resolve", root, e))?;

    let metadata = fs::metadata(&root).map_err(|e| MigrateError::fs("Failed to read", &root, e))?;
    if !metadata.is_dir() {
        return Err(MigrateError::fs(
            "Failed to import",
            &root,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
        ));
    }

    let paths = collect_files(&root);
    debug!("Found {} files under {}", paths.len(), root.display());

    let mut stats = TransferStats::default();
    for path in paths {
        let key = storage_key(&root, &path)?;
        info!("Importing {}...", key);

        let content = fs::read(&path).map_err(|e| MigrateError::fs("Failed to read", &path, e))?;
        storage
            .store(&key, &content)
            .map_err(|e| MigrateError::storage(&key, e))?;

        if opts.verify {
            verify_stored(storage, &key, &content)?;
        }
        stats.record(content.len());
    }

    Ok(stats)
}

/// Every non-directory entry below `root`. Entries that can't be read are
/// skipped with a warning.
fn collect_files(root: &Path) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(root).min_depth(1) {
        match entry {
            Ok(entry) if !entry.file_type().is_dir() => paths.push(entry.into_path()),
            Ok(_) => {}
            Err(e) => {
                let location = e.path().map(|p| p.display().to_string()).unwrap_or_default();
                warn!("Error occurred in {}: {}", location, e);
            }
        }
    }
    paths
}

fn storage_key(root: &Path, path: &Path) -> Result<String, MigrateError> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| MigrateError::InvalidKey(path.display().to_string()))?;
    let rel = rel
        .to_str()
        .ok_or_else(|| MigrateError::InvalidKey(path.display().to_string()))?;
    Ok(format!("{}{}", MAIN_SEPARATOR, rel))
}

fn verify_stored(storage: &dyn Storage, key: &str, content: &[u8]) -> Result<(), MigrateError> {
    let stored = storage.load(key).map_err(|e| MigrateError::storage(key, e))?;
    let expected = utils::sha256_hex(content);
    let actual = utils::sha256_hex(&stored);
    if expected != actual {
        return Err(MigrateError::ChecksumMismatch {
            key: key.to_string(),
            expected,
            actual,
        });
    }
    debug!("Verified {} ({})", key, actual);
    Ok(())
}
