use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use log::{debug, warn};
use serde::Deserialize;
use walkdir::WalkDir;

use crate::backend::error::StorageError;
use crate::backend::traits::{KeyInfo, ProvisionContext, Provisioner, Storage, Validator};
use crate::utils;

const LOCKS_SUFFIX: &str = ".locks";
const LOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Stores every key as a file below `root`, the same layout the import and
/// export commands read and write.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FileStorage {
    pub root: PathBuf,
    /// Locks older than this are considered abandoned and broken.
    pub stale_after_secs: u64,
}

impl Default for FileStorage {
    fn default() -> Self {
        Self {
            root: PathBuf::from("certstore"),
            stale_after_secs: 2 * 60 * 60,
        }
    }
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    fn key_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let mut path = self.root.clone();
        for segment in key.split(['/', '\\']).filter(|s| !s.is_empty()) {
            match Path::new(segment).components().next() {
                Some(Component::Normal(_)) => path.push(segment),
                _ => {
                    return Err(StorageError::Other(format!(
                        "Key escapes storage root: {}",
                        key
                    )))
                }
            }
        }
        Ok(path)
    }

    /// Lock files live in a sibling `<root>.locks` directory so that every
    /// file below `root` is a key.
    fn locks_dir(&self) -> Result<PathBuf, StorageError> {
        let root: PathBuf = std::path::absolute(&self.root)
            .map_err(|e| StorageError::io(format!("Failed to resolve {}", self.root.display()), e))?
            .components()
            .collect();
        match root.file_name() {
            Some(name) => {
                let mut dir_name = name.to_os_string();
                dir_name.push(LOCKS_SUFFIX);
                Ok(root.with_file_name(dir_name))
            }
            None => Err(StorageError::InvalidConfig(format!(
                "Cannot place locks next to storage root {}",
                root.display()
            ))),
        }
    }

    fn lock_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let safe: String = key
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
                _ => '_',
            })
            .collect();
        Ok(self.locks_dir()?.join(format!("{}.lock", safe)))
    }

    fn relative_key(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let segments: Option<Vec<&str>> = rel.components().map(|c| c.as_os_str().to_str()).collect();
        Some(segments?.join("/"))
    }

    fn lock_is_stale(&self, path: &Path) -> bool {
        let age = fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| SystemTime::now().duration_since(t).ok());
        matches!(age, Some(age) if age.as_secs() > self.stale_after_secs)
    }
}

impl Storage for FileStorage {
    fn name(&self) -> &str {
        "file"
    }

    fn store(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let path = self.key_path(key)?;
        if let Some(parent) = path.parent() {
            utils::create_private_dir_all(parent).map_err(|e| {
                StorageError::io(format!("Failed to create directory: {}", parent.display()), e)
            })?;
        }
        utils::write_private(&path, value)
            .map_err(|e| StorageError::io(format!("Failed to write file: {}", path.display()), e))
    }

    fn load(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.key_path(key)?;
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            _ => StorageError::io(format!("Failed to read file: {}", path.display()), e),
        })
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.key_path(key)?;
        if !path.exists() {
            return Err(StorageError::NotFound(key.to_string()));
        }

        if path.is_dir() {
            fs::remove_dir_all(&path).map_err(|e| {
                StorageError::io(format!("Failed to delete directory: {}", path.display()), e)
            })
        } else {
            fs::remove_file(&path)
                .map_err(|e| StorageError::io(format!("Failed to delete file: {}", path.display()), e))
        }
    }

    fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<String>, StorageError> {
        let dir = self.key_path(prefix)?;
        if !dir.exists() {
            if prefix.is_empty() {
                return Ok(Vec::new());
            }
            return Err(StorageError::NotFound(prefix.to_string()));
        }

        let max_depth = if recursive { usize::MAX } else { 1 };
        let mut keys = Vec::new();
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(max_depth) {
            let entry = entry.map_err(|e| {
                let message = format!("Failed to list directory: {}", dir.display());
                StorageError::io(message, e.into())
            })?;
            if recursive && entry.file_type().is_dir() {
                continue;
            }
            match self.relative_key(entry.path()) {
                Some(key) => keys.push(key),
                None => warn!("Skipping non UTF-8 path {}", entry.path().display()),
            }
        }

        Ok(keys)
    }

    fn stat(&self, key: &str) -> Result<KeyInfo, StorageError> {
        let path = self.key_path(key)?;
        let metadata = fs::metadata(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            _ => StorageError::io(format!("Failed to read metadata: {}", path.display()), e),
        })?;

        Ok(KeyInfo {
            key: key.to_string(),
            modified: metadata.modified().ok(),
            size: if metadata.is_file() { metadata.len() } else { 0 },
            is_terminal: !metadata.is_dir(),
        })
    }

    fn lock(&self, key: &str) -> Result<(), StorageError> {
        let path = self.lock_path(key)?;
        if let Some(parent) = path.parent() {
            utils::create_private_dir_all(parent).map_err(|e| {
                StorageError::io(format!("Failed to create directory: {}", parent.display()), e)
            })?;
        }

        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {
                    debug!("Acquired lock {}", path.display());
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if self.lock_is_stale(&path) {
                        warn!("Removing stale lock {}", path.display());
                        match fs::remove_file(&path) {
                            Ok(()) => continue,
                            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                            Err(e) => {
                                return Err(StorageError::Lock(format!(
                                    "Failed to remove stale lock {}: {}",
                                    path.display(),
                                    e
                                )))
                            }
                        }
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => {
                    return Err(StorageError::Lock(format!(
                        "Failed to create lock {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
    }

    fn unlock(&self, key: &str) -> Result<(), StorageError> {
        let path = self.lock_path(key)?;
        fs::remove_file(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StorageError::Lock(format!("'{}' is not locked", key)),
            _ => StorageError::Lock(format!("Failed to remove lock {}: {}", path.display(), e)),
        })
    }

    fn as_provisioner(&mut self) -> Option<&mut dyn Provisioner> {
        Some(self)
    }

    fn as_validator(&self) -> Option<&dyn Validator> {
        Some(self)
    }
}

impl Provisioner for FileStorage {
    fn provision(&mut self, _ctx: &ProvisionContext) -> Result<(), StorageError> {
        if self.root.as_os_str().is_empty() {
            return Ok(());
        }
        utils::create_private_dir_all(&self.root).map_err(|e| {
            StorageError::io(format!("Failed to create storage root: {}", self.root.display()), e)
        })
    }
}

impl Validator for FileStorage {
    fn validate(&self) -> Result<(), StorageError> {
        if self.root.as_os_str().is_empty() {
            return Err(StorageError::InvalidConfig("'root' must not be empty".to_string()));
        }
        if !self.root.is_dir() {
            return Err(StorageError::InvalidConfig(format!(
                "Storage root is not a directory: {}",
                self.root.display()
            )));
        }
        Ok(())
    }
}
