pub mod backend;
pub mod config;
pub mod error;
pub mod operations;
pub mod utils;

pub use backend::{init_storage, Registry, Storage, StorageEntry, StorageError};
pub use error::MigrateError;
pub use operations::{export_files, import_files, TransferStats};
