pub mod error;
pub mod factory;
pub mod file;
#[cfg(feature = "redis")]
pub mod redis;
pub mod traits;

pub use error::StorageError;
pub use factory::{init_storage, Registry, StorageEntry};
pub use traits::{HostConfig, KeyInfo, ProvisionContext, Provisioner, Storage, Validator};
