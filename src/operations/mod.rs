pub mod export;
pub mod import;

pub use export::export_files;
pub use import::{import_files, import_files_with_options, ImportOptions};

/// Totals for one import or export run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    pub files: usize,
    pub bytes: u64,
}

impl TransferStats {
    fn record(&mut self, len: usize) {
        self.files += 1;
        self.bytes += len as u64;
    }
}
