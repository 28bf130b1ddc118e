use crate::batch::CancelToken;
use crate::classify::{self, WorkbookSignal};
use crate::config::AppConfig;
use crate::engine::{start_engine, EngineError, EngineLauncher, OpenOptions, SpreadsheetEngine, Workbook};
use crate::error::Error;
use crate::model::{AuditTarget, SheetSignal, WorkbookReport};
use crate::progress::ProgressReporter;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

const ACCESS_REASON_CHARS: usize = 30;

/// Runs the heuristic audit over `paths`, in order, on a single engine
/// instance.
///
/// Every path yields exactly one report. The only fatal condition is an
/// engine that cannot be started; a cancelled batch hands back the reports
/// finished so far in `Error::Cancelled`.
pub fn audit<L: EngineLauncher>(
    launcher: &L,
    paths: &[PathBuf],
    config: &AppConfig,
    reporter: &dyn ProgressReporter,
    cancel: &CancelToken,
) -> Result<Vec<WorkbookReport>, Error> {
    let batch_start = Instant::now();
    if config.engine.reset_before_batch {
        reset_engine(launcher);
    }

    let mut guard = start_engine(launcher).map_err(Error::EngineStart)?;
    let engine = guard.engine();
    info!("Auditing {} workbook(s)", paths.len());
    reporter.on_batch_start(paths.len());

    let mut reports = Vec::with_capacity(paths.len());
    for (index, path) in paths.iter().enumerate() {
        if cancel.is_cancelled() {
            info!("Audit cancelled after {} of {} file(s)", index, paths.len());
            reporter.on_batch_complete(index, batch_start.elapsed().as_secs_f64());
            return Err(Error::Cancelled { completed: reports });
        }
        reporter.on_file_start(index, path);
        let report = audit_workbook(engine, &AuditTarget::new(path), config);
        debug!(
            "{}: {} with {} issue(s)",
            report.file_name,
            report.health,
            report.issues.len()
        );
        reporter.on_file_audited(index, report.health);
        reports.push(report);
    }

    let elapsed = batch_start.elapsed().as_secs_f64();
    info!("Audit of {} workbook(s) finished in {:.2}s", reports.len(), elapsed);
    reporter.on_batch_complete(reports.len(), elapsed);
    Ok(reports)
}

/// Clears leftovers from a crashed run. Failure only gets logged.
pub fn reset_engine<L: EngineLauncher>(launcher: &L) {
    match launcher.reset() {
        Ok(summary) => info!(
            "Engine reset: {} stale process(es) terminated, working set trimmed: {}",
            summary.processes_terminated, summary.working_set_trimmed
        ),
        Err(e) => warn!("Engine reset failed: {}", e),
    }
}

/// The short reason shown for a workbook that could not be opened.
pub fn access_reason(error: &EngineError) -> String {
    error.to_string().chars().take(ACCESS_REASON_CHARS).collect()
}

pub fn audit_workbook<E: SpreadsheetEngine>(
    engine: &mut E,
    target: &AuditTarget,
    config: &AppConfig,
) -> WorkbookReport {
    let open_start = Instant::now();
    let mut workbook = match engine.open(&target.path, OpenOptions::audit()) {
        Ok(workbook) => workbook,
        Err(e) => {
            warn!("Could not open {}: {}", target.path.display(), e);
            return WorkbookReport::critical(target, access_reason(&e));
        }
    };
    let open_duration = open_start.elapsed();

    let sheets: Vec<SheetSignal> = workbook
        .sheet_names()
        .into_iter()
        .enumerate()
        .map(|(index, name)| read_sheet(&workbook, index, name, config.checks.full_column_refs))
        .collect();

    let mut issues: Vec<_> = sheets
        .iter()
        .flat_map(|sheet| classify::sheet_issues(sheet, &config.thresholds))
        .collect();

    let calculation_duration = if config.checks.measure_calculation {
        let calc_start = Instant::now();
        match workbook.calculate_full() {
            Ok(()) => Some(calc_start.elapsed()),
            Err(e) => {
                debug!("Recalculation not measured for {}: {}", target.path.display(), e);
                None
            }
        }
    } else {
        None
    };

    let signal = WorkbookSignal {
        has_vba: workbook.has_vba_project().ok(),
        link_count: workbook.link_sources().ok().map(|links| links.len()),
        connection_count: workbook.connection_count().ok(),
        extension: target
            .path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default(),
        native_extension: engine.native_format().extension().to_string(),
        size_bytes: target.size_bytes,
        open_duration,
        calculation_duration,
    };
    issues.extend(classify::workbook_issues(&signal, config));

    if let Err(e) = workbook.close(false) {
        warn!("Error closing {}: {}", target.path.display(), e);
    }

    WorkbookReport::from_scan(target, sheets, issues, open_duration, calculation_duration)
}

fn read_sheet<W: Workbook>(workbook: &W, index: usize, name: String, full_column_refs: bool) -> SheetSignal {
    let used = workbook.used_range(index).ok();
    let formulas = workbook.formulas(index).ok();
    SheetSignal {
        used_rows: used.map(|r| r.rows()),
        used_columns: used.map(|r| r.columns()),
        real_data_cells: workbook.non_blank_count(index).ok(),
        last_data_row: workbook
            .last_data_cell(index)
            .ok()
            .map(|cell| cell.map_or(0, |c| u64::from(c.row))),
        formula_count: formulas.as_ref().map(|f| f.len() as u64),
        pivot_table_count: workbook.pivot_table_count(index).ok().map(|c| c as u64),
        shape_count: workbook.shape_count(index).ok().map(|c| c as u64),
        volatile_match: formulas.as_deref().map(classify::has_volatile_call),
        full_column_match: formulas
            .as_deref()
            .filter(|_| full_column_refs)
            .map(classify::has_full_column_reference),
        name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::{MemoryLauncher, MemorySheet, MemoryStore, Fault, WorkbookModel};
    use crate::model::{Health, Issue};
    use crate::progress::SilentReporter;

    fn run(launcher: &MemoryLauncher, paths: &[&str]) -> Result<Vec<WorkbookReport>, Error> {
        let paths: Vec<PathBuf> = paths.iter().map(PathBuf::from).collect();
        audit(
            launcher,
            &paths,
            &AppConfig::default(),
            &SilentReporter,
            &CancelToken::new(),
        )
    }

    #[test]
    fn test_access_reason_is_truncated() {
        let reason = access_reason(&EngineError::Corrupt("x".repeat(80)));
        assert_eq!(reason.chars().count(), 30);
        assert!(reason.starts_with("not a readable workbook"));
    }

    #[test]
    fn test_failed_read_omits_signal() {
        let store = MemoryStore::new();
        store.insert(
            "blind.xlsb",
            WorkbookModel::new(vec![MemorySheet::new("Data").with_formatting_to(6000, 3)])
                .failing(Fault::NonBlank)
                .failing(Fault::Vba),
        );
        let reports = run(&MemoryLauncher::new(store), &["blind.xlsb"]).unwrap();
        let sheet = &reports[0].sheets[0];
        assert_eq!(sheet.used_rows, Some(6000));
        assert_eq!(sheet.real_data_cells, None);
        assert!(!reports[0].issues.iter().any(|i| matches!(i, Issue::PhantomRows { .. })));
        assert!(!reports[0].issues.contains(&Issue::VbaPresent));
    }

    #[test]
    fn test_empty_sheet_counts_as_no_data() {
        let store = MemoryStore::new();
        store.insert("empty.xlsb", WorkbookModel::new(vec![MemorySheet::new("Empty")]));
        let reports = run(&MemoryLauncher::new(store), &["empty.xlsb"]).unwrap();
        assert_eq!(reports[0].sheets[0].last_data_row, Some(0));
        assert_eq!(reports[0].health, Health::Stable);
    }

    #[test]
    fn test_reset_only_when_configured() {
        let store = MemoryStore::new();
        let launcher = MemoryLauncher::new(store.clone());
        run(&launcher, &[]).unwrap();
        assert_eq!(store.stats().resets, 0);

        let mut config = AppConfig::default();
        config.engine.reset_before_batch = true;
        audit(&launcher, &[], &config, &SilentReporter, &CancelToken::new()).unwrap();
        assert_eq!(store.stats().resets, 1);
    }

    #[test]
    fn test_calculation_can_be_skipped() {
        let store = MemoryStore::new();
        store.insert(
            "calc.xlsb",
            WorkbookModel::new(vec![MemorySheet::new("Data").with_value(1, 1, "1")]),
        );
        let mut config = AppConfig::default();
        config.checks.measure_calculation = false;
        let reports = audit(
            &MemoryLauncher::new(store),
            &[PathBuf::from("calc.xlsb")],
            &config,
            &SilentReporter,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(reports[0].calculation_duration, None);
    }
}
