pub mod auditor;
pub mod batch;
pub mod classify;
pub mod config;
pub mod engine;
pub mod error;
pub mod inputs;
pub mod model;
pub mod platform;
pub mod progress;
pub mod repair;
pub mod report;

pub use auditor::audit;
pub use batch::{spawn_audit, spawn_repair, BatchEvent, BatchHandle, CancelToken, ChannelReporter};
pub use config::AppConfig;
pub use error::Error;
pub use model::{AuditTarget, FixCategory, Health, Issue, SheetSignal, WorkbookReport};
pub use progress::{ProgressReporter, SilentReporter};
pub use repair::{repair, RepairAction, RepairJob, RepairOutcome, RepairPlan, RepairStatus};
