use crate::model::Health;
use crate::repair::RepairStatus;
use std::path::Path;

/// Trait for reporting batch progress.
///
/// The batch worker forwards these over a channel; the CLI renders them
/// with indicatif. All methods have default no-op implementations.
pub trait ProgressReporter: Send + Sync {
    fn on_batch_start(&self, _total: usize) {}
    fn on_file_start(&self, _index: usize, _path: &Path) {}
    fn on_file_audited(&self, _index: usize, _health: Health) {}
    fn on_file_repaired(&self, _index: usize, _status: RepairStatus) {}
    fn on_batch_complete(&self, _files: usize, _duration_secs: f64) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}
