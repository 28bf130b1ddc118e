//! Mutating fixes for the issues the auditor reports.

use crate::auditor::{access_reason, reset_engine};
use crate::batch::CancelToken;
use crate::config::AppConfig;
use crate::engine::{start_engine, EngineError, EngineLauncher, FileFormat, OpenOptions, SpreadsheetEngine, Workbook};
use crate::error::Error;
use crate::model::{FixCategory, Issue, WorkbookReport};
use crate::progress::ProgressReporter;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum RepairAction {
    PurgeGhostRows,
    RebuildCalculationChain,
    ConvertToBinary,
}

impl RepairAction {
    pub fn for_fix(fix: FixCategory) -> Option<RepairAction> {
        match fix {
            FixCategory::PurgeGhostRows => Some(RepairAction::PurgeGhostRows),
            FixCategory::RebuildCalculationChain => Some(RepairAction::RebuildCalculationChain),
            FixCategory::ConvertToBinary => Some(RepairAction::ConvertToBinary),
            FixCategory::ManualReview => None,
        }
    }
}

impl fmt::Display for RepairAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RepairAction::PurgeGhostRows => "purge ghost rows",
            RepairAction::RebuildCalculationChain => "rebuild calculation chain",
            RepairAction::ConvertToBinary => "convert to native format",
        };
        f.write_str(label)
    }
}

/// An ordered, duplicate-free set of actions for one workbook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairPlan {
    actions: BTreeSet<RepairAction>,
}

impl RepairPlan {
    pub fn new<I: IntoIterator<Item = RepairAction>>(actions: I) -> Self {
        Self {
            actions: actions.into_iter().collect(),
        }
    }

    /// Every action: purge, then rebuild, then convert.
    pub fn all() -> Self {
        Self::new([
            RepairAction::PurgeGhostRows,
            RepairAction::RebuildCalculationChain,
            RepairAction::ConvertToBinary,
        ])
    }

    pub fn from_issues(issues: &[Issue]) -> Self {
        Self::new(issues.iter().filter_map(|i| RepairAction::for_fix(i.fix())))
    }

    pub fn actions(&self) -> impl Iterator<Item = RepairAction> + '_ {
        self.actions.iter().copied()
    }

    pub fn contains(&self, action: RepairAction) -> bool {
        self.actions.contains(&action)
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairJob {
    pub path: PathBuf,
    pub plan: RepairPlan,
}

impl RepairJob {
    pub fn new(path: impl Into<PathBuf>, plan: RepairPlan) -> Self {
        Self {
            path: path.into(),
            plan,
        }
    }

    /// The plan the audit suggests. Critical reports get an empty plan.
    pub fn from_report(report: &WorkbookReport) -> Self {
        Self::new(report.path.clone(), RepairPlan::from_issues(&report.issues))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum RepairStep {
    PurgeGhostRows { rows_deleted: u64 },
    RebuildCalculationChain,
    ConvertToBinary { output: PathBuf },
}

impl RepairStep {
    pub fn action(&self) -> RepairAction {
        match self {
            RepairStep::PurgeGhostRows { .. } => RepairAction::PurgeGhostRows,
            RepairStep::RebuildCalculationChain => RepairAction::RebuildCalculationChain,
            RepairStep::ConvertToBinary { .. } => RepairAction::ConvertToBinary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RepairStage {
    Open,
    Action(RepairAction),
    Save,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairFailure {
    pub stage: RepairStage,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RepairStatus {
    Repaired,
    Partial,
    Failed,
}

impl fmt::Display for RepairStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RepairStatus::Repaired => "Repaired",
            RepairStatus::Partial => "Partial",
            RepairStatus::Failed => "Failed",
        };
        f.write_str(label)
    }
}

/// `completed` steps are on disk. `discarded` steps ran in the engine but
/// were lost because the workbook could not be saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairOutcome {
    pub path: PathBuf,
    pub completed: Vec<RepairStep>,
    pub discarded: Vec<RepairStep>,
    pub failure: Option<RepairFailure>,
    pub output: Option<PathBuf>,
    pub rows_deleted: u64,
}

impl RepairOutcome {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            completed: Vec::new(),
            discarded: Vec::new(),
            failure: None,
            output: None,
            rows_deleted: 0,
        }
    }

    fn discard(&mut self) {
        self.discarded.append(&mut self.completed);
        self.rows_deleted = 0;
        self.output = None;
    }

    pub fn status(&self) -> RepairStatus {
        match (&self.failure, self.completed.is_empty()) {
            (None, _) => RepairStatus::Repaired,
            (Some(_), true) => RepairStatus::Failed,
            (Some(_), false) => RepairStatus::Partial,
        }
    }
}

/// `<dir>/<stem><suffix>.<ext>` next to the source workbook.
pub fn converted_path(source: &Path, suffix: &str, format: FileFormat) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = format!("{}{}.{}", stem, suffix, format.extension());
    match source.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Applies each job's plan in order on one engine instance.
pub fn repair<L: EngineLauncher>(
    launcher: &L,
    jobs: &[RepairJob],
    config: &AppConfig,
    reporter: &dyn ProgressReporter,
    cancel: &CancelToken,
) -> Result<Vec<RepairOutcome>, Error> {
    let batch_start = Instant::now();
    if config.engine.reset_before_batch {
        reset_engine(launcher);
    }

    let mut guard = start_engine(launcher).map_err(Error::EngineStart)?;
    let engine = guard.engine();
    info!("Repairing {} workbook(s)", jobs.len());
    reporter.on_batch_start(jobs.len());

    let mut outcomes = Vec::with_capacity(jobs.len());
    for (index, job) in jobs.iter().enumerate() {
        if cancel.is_cancelled() {
            info!("Repair cancelled after {} of {} file(s)", index, jobs.len());
            reporter.on_batch_complete(index, batch_start.elapsed().as_secs_f64());
            return Err(Error::RepairCancelled { completed: outcomes });
        }
        reporter.on_file_start(index, &job.path);
        let outcome = repair_workbook(engine, job, &config.repair.output_suffix);
        reporter.on_file_repaired(index, outcome.status());
        outcomes.push(outcome);
    }

    let elapsed = batch_start.elapsed().as_secs_f64();
    info!("Repair of {} workbook(s) finished in {:.2}s", outcomes.len(), elapsed);
    reporter.on_batch_complete(outcomes.len(), elapsed);
    Ok(outcomes)
}

pub fn repair_workbook<E: SpreadsheetEngine>(engine: &mut E, job: &RepairJob, suffix: &str) -> RepairOutcome {
    let mut outcome = RepairOutcome::new(&job.path);
    if job.plan.is_empty() {
        info!("Nothing to repair in {}", job.path.display());
        return outcome;
    }

    let mut workbook = match engine.open(&job.path, OpenOptions::repair()) {
        Ok(workbook) => workbook,
        Err(e) => {
            warn!("Could not open {} for repair: {}", job.path.display(), e);
            outcome.failure = Some(RepairFailure {
                stage: RepairStage::Open,
                reason: access_reason(&e),
            });
            return outcome;
        }
    };
    let native = engine.native_format();

    for action in job.plan.actions() {
        let result = match action {
            RepairAction::PurgeGhostRows => purge_ghost_rows(&mut workbook).map(|rows_deleted| {
                outcome.rows_deleted += rows_deleted;
                RepairStep::PurgeGhostRows { rows_deleted }
            }),
            RepairAction::RebuildCalculationChain => workbook
                .calculate_full_rebuild()
                .map(|()| RepairStep::RebuildCalculationChain),
            RepairAction::ConvertToBinary => {
                let output = converted_path(&job.path, suffix, native);
                workbook.save_as(&output, native).map(|()| {
                    outcome.output = Some(output.clone());
                    RepairStep::ConvertToBinary { output }
                })
            }
        };
        match result {
            Ok(step) => {
                debug!("{}: {} done", job.path.display(), action);
                outcome.completed.push(step);
            }
            Err(e) => {
                error!("{}: {} failed: {}", job.path.display(), action, e);
                outcome.failure = Some(RepairFailure {
                    stage: RepairStage::Action(action),
                    reason: e.to_string(),
                });
                // Completed steps only exist in the engine until saved.
                if !outcome.completed.is_empty() {
                    if let Err(e) = workbook.save() {
                        error!("{}: completed repairs not saved: {}", job.path.display(), e);
                        outcome.discard();
                    }
                }
                close_quietly(workbook, &job.path);
                return outcome;
            }
        }
    }

    if outcome.output.is_none() {
        if let Err(e) = workbook.save() {
            error!("{}: save failed: {}", job.path.display(), e);
            outcome.failure = Some(RepairFailure {
                stage: RepairStage::Save,
                reason: e.to_string(),
            });
            outcome.discard();
        }
    }
    close_quietly(workbook, &job.path);

    info!(
        "{}: {} ({} step(s))",
        job.path.display(),
        outcome.status(),
        outcome.completed.len()
    );
    outcome
}

/// Deletes everything below the last real data row of every sheet. Sheets
/// without data are left alone.
fn purge_ghost_rows<W: Workbook>(workbook: &mut W) -> Result<u64, EngineError> {
    let mut removed = 0;
    for index in 0..workbook.sheet_names().len() {
        if let Some(last) = workbook.last_data_cell(index)? {
            removed += workbook.delete_rows_after(index, last.row)?;
        }
    }
    Ok(removed)
}

fn close_quietly<W: Workbook>(workbook: W, path: &Path) {
    if let Err(e) = workbook.close(false) {
        warn!("Error closing {}: {}", path.display(), e);
    }
}
