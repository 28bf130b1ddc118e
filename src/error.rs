use crate::engine::EngineError;
use crate::model::WorkbookReport;
use crate::repair::RepairOutcome;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Spreadsheet engine could not be started: {0}")]
    EngineStart(#[source] EngineError),

    #[error("Batch cancelled after {} file(s)", completed.len())]
    Cancelled { completed: Vec<WorkbookReport> },

    #[error("Repair cancelled after {} file(s)", completed.len())]
    RepairCancelled { completed: Vec<RepairOutcome> },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("{0}")]
    Other(String),
}
