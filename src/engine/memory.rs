//! An engine over in-memory workbook models.
//!
//! Models live in a shared [`MemoryStore`] keyed by path, so a workbook
//! saved by one batch can be audited by the next. Every signal read can be
//! made to fail, which is how the per-signal fallbacks of the auditor are
//! exercised without a real spreadsheet application.

use super::{
    CellRef, EngineError, EngineLauncher, FileFormat, OpenOptions, ResetSummary,
    SpreadsheetEngine, UsedRange, Workbook,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryCell {
    Value(String),
    Formula(String),
}

#[derive(Debug, Clone, Default)]
pub struct MemorySheet {
    pub name: String,
    /// Keyed by (row, col), both 1-based.
    pub cells: BTreeMap<(u32, u32), MemoryCell>,
    /// Bottom-right corner of formatting that extends past the data.
    pub formatted_to: Option<CellRef>,
    pub pivot_tables: usize,
    pub shapes: usize,
}

impl MemorySheet {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_value(mut self, row: u32, col: u32, value: &str) -> Self {
        self.cells
            .insert((row, col), MemoryCell::Value(value.to_string()));
        self
    }

    pub fn with_formula(mut self, row: u32, col: u32, formula: &str) -> Self {
        self.cells
            .insert((row, col), MemoryCell::Formula(formula.to_string()));
        self
    }

    /// Fills `rows` x `cols` values starting at A1.
    pub fn with_data_block(mut self, rows: u32, cols: u32) -> Self {
        for row in 1..=rows {
            for col in 1..=cols {
                self.cells
                    .insert((row, col), MemoryCell::Value(format!("r{}c{}", row, col)));
            }
        }
        self
    }

    /// Stale formatting reaching down to `row` in column `col`.
    pub fn with_formatting_to(mut self, row: u32, col: u32) -> Self {
        self.formatted_to = Some(CellRef { row, col });
        self
    }

    pub fn with_pivot_tables(mut self, count: usize) -> Self {
        self.pivot_tables = count;
        self
    }

    pub fn with_shapes(mut self, count: usize) -> Self {
        self.shapes = count;
        self
    }

    pub fn used_range(&self) -> UsedRange {
        let mut range: Option<UsedRange> = None;
        let mut include = |cell: CellRef| {
            range = Some(match range {
                None => UsedRange {
                    first: cell,
                    last: cell,
                },
                Some(r) => UsedRange {
                    first: CellRef {
                        row: r.first.row.min(cell.row),
                        col: r.first.col.min(cell.col),
                    },
                    last: CellRef {
                        row: r.last.row.max(cell.row),
                        col: r.last.col.max(cell.col),
                    },
                },
            });
        };
        for &(row, col) in self.cells.keys() {
            include(CellRef { row, col });
        }
        if let Some(corner) = self.formatted_to {
            include(CellRef { row: 1, col: 1 });
            include(corner);
        }
        range.unwrap_or(UsedRange {
            first: CellRef { row: 1, col: 1 },
            last: CellRef { row: 1, col: 1 },
        })
    }

    pub fn last_data_cell(&self) -> Option<CellRef> {
        let (&(last_row, _), _) = self.cells.iter().next_back()?;
        let col = self
            .cells
            .range((last_row, 0)..=(last_row, u32::MAX))
            .map(|(&(_, col), _)| col)
            .max()?;
        Some(CellRef { row: last_row, col })
    }
}

/// Signals and operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    UsedRange,
    NonBlank,
    LastDataCell,
    Formulas,
    PivotTables,
    Shapes,
    Vba,
    Links,
    Connections,
    Calculate,
    Rebuild,
    DeleteRows,
    Save,
}

#[derive(Debug, Clone, Default)]
pub struct WorkbookModel {
    pub sheets: Vec<MemorySheet>,
    pub vba_project: bool,
    pub link_sources: Vec<String>,
    pub connections: usize,
    pub password_protected: bool,
    pub locked: bool,
    pub open_delay: Duration,
    pub calc_delay: Duration,
    pub failing: HashSet<Fault>,
    pub format: Option<FileFormat>,
    pub calc_chain_rebuilt: bool,
}

impl WorkbookModel {
    pub fn new(sheets: Vec<MemorySheet>) -> Self {
        Self {
            sheets,
            ..Default::default()
        }
    }

    pub fn with_vba(mut self) -> Self {
        self.vba_project = true;
        self
    }

    pub fn with_links(mut self, links: &[&str]) -> Self {
        self.link_sources = links.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn with_connections(mut self, count: usize) -> Self {
        self.connections = count;
        self
    }

    pub fn password_protected(mut self) -> Self {
        self.password_protected = true;
        self
    }

    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn with_calc_delay(mut self, delay: Duration) -> Self {
        self.calc_delay = delay;
        self
    }

    pub fn failing(mut self, fault: Fault) -> Self {
        self.failing.insert(fault);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub resets: usize,
    pub launches: usize,
    pub quits: usize,
    pub opened: Vec<(PathBuf, OpenOptions)>,
    pub closed_with_save: usize,
    pub saved: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    workbooks: Arc<Mutex<HashMap<PathBuf, WorkbookModel>>>,
    stats: Arc<Mutex<EngineStats>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, model: WorkbookModel) {
        lock(&self.workbooks).insert(path.into(), model);
    }

    pub fn get(&self, path: &Path) -> Option<WorkbookModel> {
        lock(&self.workbooks).get(path).cloned()
    }

    pub fn contains(&self, path: &Path) -> bool {
        lock(&self.workbooks).contains_key(path)
    }

    pub fn stats(&self) -> EngineStats {
        lock(&self.stats).clone()
    }

    fn record<F: FnOnce(&mut EngineStats)>(&self, f: F) {
        f(&mut lock(&self.stats));
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLauncher {
    store: MemoryStore,
    launch_failure: Option<String>,
    suppress_failure: bool,
}

impl MemoryLauncher {
    pub fn new(store: MemoryStore) -> Self {
        Self {
            store,
            ..Default::default()
        }
    }

    /// Every launch fails with `reason`.
    pub fn failing_launch(mut self, reason: &str) -> Self {
        self.launch_failure = Some(reason.to_string());
        self
    }

    /// Launch succeeds but hiding the application fails, the way a wedged
    /// instance rejects its `Visible` property.
    pub fn failing_suppress(mut self) -> Self {
        self.suppress_failure = true;
        self
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

impl EngineLauncher for MemoryLauncher {
    type Engine = MemoryEngine;

    fn reset(&self) -> Result<ResetSummary, EngineError> {
        self.store.record(|s| s.resets += 1);
        Ok(ResetSummary::default())
    }

    fn launch(&self) -> Result<MemoryEngine, EngineError> {
        if let Some(reason) = &self.launch_failure {
            return Err(EngineError::Unavailable(reason.clone()));
        }
        self.store.record(|s| s.launches += 1);
        Ok(MemoryEngine {
            store: self.store.clone(),
            suppress_failure: self.suppress_failure,
            running: true,
        })
    }
}

#[derive(Debug)]
pub struct MemoryEngine {
    store: MemoryStore,
    suppress_failure: bool,
    running: bool,
}

impl SpreadsheetEngine for MemoryEngine {
    type Workbook = MemoryWorkbook;

    fn suppress_interaction(&mut self) -> Result<(), EngineError> {
        if self.suppress_failure {
            return Err(EngineError::Unavailable(
                "unable to set the Visible property".to_string(),
            ));
        }
        Ok(())
    }

    fn open(&mut self, path: &Path, options: OpenOptions) -> Result<MemoryWorkbook, EngineError> {
        if !self.running {
            return Err(EngineError::Unavailable("engine has quit".to_string()));
        }
        self.store
            .record(|s| s.opened.push((path.to_path_buf(), options)));
        let model = self.store.get(path).ok_or_else(|| {
            EngineError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            ))
        })?;
        thread::sleep(model.open_delay);
        if model.password_protected {
            return Err(EngineError::Encrypted);
        }
        if model.locked && !options.read_only {
            return Err(EngineError::Locked(path.to_path_buf()));
        }
        Ok(MemoryWorkbook {
            store: self.store.clone(),
            path: path.to_path_buf(),
            model,
            read_only: options.read_only,
        })
    }

    fn native_format(&self) -> FileFormat {
        FileFormat::Xlsb
    }

    fn quit(&mut self) -> Result<(), EngineError> {
        if self.running {
            self.running = false;
            self.store.record(|s| s.quits += 1);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryWorkbook {
    store: MemoryStore,
    path: PathBuf,
    model: WorkbookModel,
    read_only: bool,
}

impl MemoryWorkbook {
    fn fail_on(&self, fault: Fault) -> Result<(), EngineError> {
        if self.model.failing.contains(&fault) {
            return Err(EngineError::Unsupported(format!("{:?} read failed", fault)));
        }
        Ok(())
    }

    fn sheet(&self, index: usize) -> Result<&MemorySheet, EngineError> {
        self.model
            .sheets
            .get(index)
            .ok_or(EngineError::NoSuchSheet(index))
    }

    fn persist(&mut self, path: &Path) -> Result<(), EngineError> {
        self.fail_on(Fault::Save)?;
        if self.read_only && path == self.path {
            return Err(EngineError::Unsupported(
                "workbook was opened read-only".to_string(),
            ));
        }
        self.store.insert(path.to_path_buf(), self.model.clone());
        self.store.record(|s| s.saved.push(path.to_path_buf()));
        Ok(())
    }
}

impl Workbook for MemoryWorkbook {
    fn sheet_names(&self) -> Vec<String> {
        self.model.sheets.iter().map(|s| s.name.clone()).collect()
    }

    fn used_range(&self, sheet: usize) -> Result<UsedRange, EngineError> {
        self.fail_on(Fault::UsedRange)?;
        Ok(self.sheet(sheet)?.used_range())
    }

    fn non_blank_count(&self, sheet: usize) -> Result<u64, EngineError> {
        self.fail_on(Fault::NonBlank)?;
        Ok(self.sheet(sheet)?.cells.len() as u64)
    }

    fn last_data_cell(&self, sheet: usize) -> Result<Option<CellRef>, EngineError> {
        self.fail_on(Fault::LastDataCell)?;
        Ok(self.sheet(sheet)?.last_data_cell())
    }

    fn formulas(&self, sheet: usize) -> Result<Vec<String>, EngineError> {
        self.fail_on(Fault::Formulas)?;
        Ok(self
            .sheet(sheet)?
            .cells
            .values()
            .filter_map(|cell| match cell {
                MemoryCell::Formula(f) => Some(f.clone()),
                MemoryCell::Value(_) => None,
            })
            .collect())
    }

    fn pivot_table_count(&self, sheet: usize) -> Result<usize, EngineError> {
        self.fail_on(Fault::PivotTables)?;
        Ok(self.sheet(sheet)?.pivot_tables)
    }

    fn shape_count(&self, sheet: usize) -> Result<usize, EngineError> {
        self.fail_on(Fault::Shapes)?;
        Ok(self.sheet(sheet)?.shapes)
    }

    fn has_vba_project(&self) -> Result<bool, EngineError> {
        self.fail_on(Fault::Vba)?;
        Ok(self.model.vba_project)
    }

    fn link_sources(&self) -> Result<Vec<String>, EngineError> {
        self.fail_on(Fault::Links)?;
        Ok(self.model.link_sources.clone())
    }

    fn connection_count(&self) -> Result<usize, EngineError> {
        self.fail_on(Fault::Connections)?;
        Ok(self.model.connections)
    }

    fn calculate_full(&mut self) -> Result<(), EngineError> {
        self.fail_on(Fault::Calculate)?;
        thread::sleep(self.model.calc_delay);
        Ok(())
    }

    fn calculate_full_rebuild(&mut self) -> Result<(), EngineError> {
        self.fail_on(Fault::Rebuild)?;
        thread::sleep(self.model.calc_delay);
        self.model.calc_chain_rebuilt = true;
        Ok(())
    }

    fn delete_rows_after(&mut self, sheet: usize, last_row: u32) -> Result<u64, EngineError> {
        self.fail_on(Fault::DeleteRows)?;
        let sheet = self
            .model
            .sheets
            .get_mut(sheet)
            .ok_or(EngineError::NoSuchSheet(sheet))?;
        let extent = sheet.used_range().last.row;
        sheet.cells.retain(|&(row, _), _| row <= last_row);
        if let Some(corner) = sheet.formatted_to {
            sheet.formatted_to = if last_row == 0 {
                None
            } else {
                Some(CellRef {
                    row: corner.row.min(last_row),
                    col: corner.col,
                })
            };
        }
        Ok(u64::from(extent.saturating_sub(last_row)))
    }

    fn save(&mut self) -> Result<(), EngineError> {
        let path = self.path.clone();
        self.persist(&path)
    }

    fn save_as(&mut self, path: &Path, format: FileFormat) -> Result<(), EngineError> {
        self.model.format = Some(format);
        self.persist(path)?;
        self.path = path.to_path_buf();
        self.read_only = false;
        Ok(())
    }

    fn close(mut self, save_changes: bool) -> Result<(), EngineError> {
        if save_changes {
            self.save()?;
            self.store.record(|s| s.closed_with_save += 1);
        }
        Ok(())
    }
}
