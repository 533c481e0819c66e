use std::collections::BTreeMap;

use log::debug;
use serde::de::DeserializeOwned;

use crate::backend::file::FileStorage;
#[cfg(feature = "redis")]
use crate::backend::redis::RedisStorage;
use crate::backend::traits::{ProvisionContext, Storage};
use crate::error::MigrateError;

type Constructor = fn(&[u8]) -> Result<Box<dyn Storage>, serde_json::Error>;

/// A backend name and the constructor that builds it.
pub struct StorageEntry {
    name: String,
    construct: Constructor,
}

impl StorageEntry {
    /// Registers `T` under `name`.
    ///
    /// `T::default()` is the unconfigured instance. Configuration is decoded
    /// over it, so `T` should carry `#[serde(default)]` and any key missing
    /// from the config keeps its default value.
    pub fn of<T>(name: impl Into<String>) -> Self
    where
        T: Storage + Default + DeserializeOwned + 'static,
    {
        Self {
            name: name.into(),
            construct: construct::<T>,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn construct<T>(config: &[u8]) -> Result<Box<dyn Storage>, serde_json::Error>
where
    T: Storage + Default + DeserializeOwned + 'static,
{
    let storage = if config.is_empty() {
        T::default()
    } else {
        serde_json::from_slice::<T>(config)?
    };
    Ok(Box::new(storage))
}

/// Name to constructor table. Built once at startup and read-only after.
#[derive(Default)]
pub struct Registry {
    entries: BTreeMap<String, StorageEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every backend compiled into this binary.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.insert(StorageEntry::of::<FileStorage>("file"));
        #[cfg(feature = "redis")]
        registry.insert(StorageEntry::of::<RedisStorage>("redis"));
        registry
    }

    pub fn register(&mut self, entry: StorageEntry) -> Result<(), MigrateError> {
        if self.entries.contains_key(&entry.name) {
            return Err(MigrateError::DuplicateBackend(entry.name));
        }
        self.insert(entry);
        Ok(())
    }

    fn insert(&mut self, entry: StorageEntry) {
        self.entries.insert(entry.name.clone(), entry);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Builds, configures, provisions and validates the backend `name`.
    pub fn init_storage(&self, name: &str, config: &[u8]) -> Result<Box<dyn Storage>, MigrateError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| MigrateError::BackendNotFound(name.to_string()))?;

        debug!("Creating storage '{}' ({} bytes of config)", name, config.len());
        let mut storage = (entry.construct)(config).map_err(MigrateError::ConfigParse)?;

        if let Some(provisioner) = storage.as_provisioner() {
            debug!("Provisioning storage '{}'", name);
            provisioner
                .provision(&ProvisionContext::default())
                .map_err(|source| MigrateError::Provision {
                    name: name.to_string(),
                    source,
                })?;
        }

        if let Some(validator) = storage.as_validator() {
            debug!("Validating storage '{}'", name);
            validator.validate().map_err(|source| MigrateError::Validation {
                name: name.to_string(),
                source,
            })?;
        }

        Ok(storage)
    }
}

/// Looks `name` up among the built-in backends and initializes it.
pub fn init_storage(name: &str, config: &[u8]) -> Result<Box<dyn Storage>, MigrateError> {
    Registry::with_builtin().init_storage(name, config)
}
