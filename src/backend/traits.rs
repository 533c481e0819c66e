use std::time::SystemTime;

use crate::backend::error::StorageError;

/// Metadata about a stored key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub key: String,
    pub modified: Option<SystemTime>,
    pub size: u64,
    /// False for keys that only act as a prefix of other keys.
    pub is_terminal: bool,
}

/// Host-level settings handed to a backend while it provisions itself.
///
/// The migrator runs outside any certificate manager, so this is always the
/// empty default. Backends must not depend on anything being set here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostConfig {
    pub storage_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProvisionContext {
    pub config: HostConfig,
}

/// Key-value storage for certificates and keys.
///
/// Keys are `/`-separated paths. Listing with an empty prefix and
/// `recursive == true` must return every terminal key in the store.
pub trait Storage: Send + Sync {
    fn name(&self) -> &str;

    fn store(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    fn load(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// True when `key` holds a value or is a prefix of stored keys, the two
    /// cases `stat` reports as terminal and non-terminal. Backends overriding
    /// this must keep both.
    fn exists(&self, key: &str) -> bool {
        self.stat(key).is_ok()
    }

    fn list(&self, prefix: &str, recursive: bool) -> Result<Vec<String>, StorageError>;

    fn stat(&self, key: &str) -> Result<KeyInfo, StorageError>;

    /// Blocks until the lock named `key` is held by this process.
    fn lock(&self, key: &str) -> Result<(), StorageError>;

    fn unlock(&self, key: &str) -> Result<(), StorageError>;

    fn as_provisioner(&mut self) -> Option<&mut dyn Provisioner> {
        None
    }

    fn as_validator(&self) -> Option<&dyn Validator> {
        None
    }
}

/// One-time setup run after configuration is applied, e.g. opening a
/// connection.
pub trait Provisioner {
    fn provision(&mut self, ctx: &ProvisionContext) -> Result<(), StorageError>;
}

/// Checks a provisioned backend is usable.
pub trait Validator {
    fn validate(&self) -> Result<(), StorageError>;
}
