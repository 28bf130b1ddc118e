//! A file-level engine for Office Open XML workbooks (`.xlsx`, `.xlsm`).
//!
//! The whole package is read into memory on open. Signals are computed
//! from the XML parts; repairs rewrite parts in memory and are persisted
//! only by `save` / `save_as`.

mod package;
mod sheet;
mod workbook;

use self::package::{
    relationships_of, remove_content_type_override, remove_relationships, resolve_target,
    set_content_type_override, Package, Relationship, CONTENT_TYPES,
};
use self::sheet::{count_anchors, count_elements, purge_rows_after, scan_sheet, SheetScan};
use self::workbook::{parse_sheet_entries, set_full_calc_on_load};
use super::{
    CellRef, EngineError, EngineLauncher, FileFormat, OpenOptions, ResetSummary,
    SpreadsheetEngine, UsedRange, Workbook,
};
use crate::platform;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs::{self, OpenOptions as FsOpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, info, warn};

const DEFAULT_WORKBOOK_PART: &str = "xl/workbook.xml";
const MAIN_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml";
const MACRO_MAIN_CONTENT_TYPE: &str = "application/vnd.ms-excel.sheet.macroEnabled.main+xml";

#[derive(Debug, Clone, Default)]
pub struct OoxmlLauncher {
    stale_process_names: Vec<String>,
}

impl OoxmlLauncher {
    pub fn new(stale_process_names: Vec<String>) -> Self {
        Self {
            stale_process_names,
        }
    }
}

impl EngineLauncher for OoxmlLauncher {
    type Engine = OoxmlEngine;

    fn reset(&self) -> Result<ResetSummary, EngineError> {
        let processes_terminated = platform::terminate_processes(&self.stale_process_names);
        if processes_terminated > 0 {
            info!(
                "Terminated {} stale spreadsheet process(es)",
                processes_terminated
            );
        }
        let working_set_trimmed = platform::trim_working_set();
        Ok(ResetSummary {
            processes_terminated,
            working_set_trimmed,
        })
    }

    fn launch(&self) -> Result<OoxmlEngine, EngineError> {
        Ok(OoxmlEngine { running: true })
    }
}

#[derive(Debug)]
pub struct OoxmlEngine {
    running: bool,
}

impl SpreadsheetEngine for OoxmlEngine {
    type Workbook = OoxmlWorkbook;

    /// Nothing is ever shown or prompted, and links are never refreshed.
    fn suppress_interaction(&mut self) -> Result<(), EngineError> {
        Ok(())
    }

    fn open(&mut self, path: &Path, options: OpenOptions) -> Result<OoxmlWorkbook, EngineError> {
        if !self.running {
            return Err(EngineError::Unavailable("engine has quit".to_string()));
        }
        OoxmlWorkbook::open(path, options)
    }

    /// Conversions to it fail as unsupported: this engine only writes
    /// XML packages.
    fn native_format(&self) -> FileFormat {
        FileFormat::Xlsb
    }

    fn quit(&mut self) -> Result<(), EngineError> {
        self.running = false;
        Ok(())
    }
}

/// The `~$name.xlsx` owner file held while a workbook is open for editing.
#[derive(Debug)]
struct LockMarker {
    path: PathBuf,
}

impl LockMarker {
    fn acquire(workbook: &Path) -> Result<LockMarker, EngineError> {
        let name = workbook
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let path = workbook.with_file_name(format!("~${}", name));
        match FsOpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(LockMarker { path }),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(EngineError::Locked(workbook.to_path_buf()))
            }
            Err(e) => Err(EngineError::Io(e)),
        }
    }
}

impl Drop for LockMarker {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Could not remove lock marker {}: {}", self.path.display(), e);
            }
        }
    }
}

#[derive(Debug, Clone)]
struct SheetPart {
    name: String,
    part: String,
}

#[derive(Debug)]
pub struct OoxmlWorkbook {
    path: PathBuf,
    package: Package,
    workbook_part: String,
    sheets: Vec<SheetPart>,
    scans: RefCell<HashMap<usize, Rc<SheetScan>>>,
    read_only: bool,
    lock: Option<LockMarker>,
}

impl OoxmlWorkbook {
    fn open(path: &Path, options: OpenOptions) -> Result<OoxmlWorkbook, EngineError> {
        let lock = if options.read_only {
            None
        } else {
            Some(LockMarker::acquire(path)?)
        };
        let package = Package::read(path)?;

        let workbook_part = relationships_of(&package, "")?
            .iter()
            .find(|r| r.is("officeDocument"))
            .map(|r| resolve_target("", &r.target))
            .unwrap_or_else(|| DEFAULT_WORKBOOK_PART.to_string());
        let workbook_xml = package.require(&workbook_part)?;
        let entries = parse_sheet_entries(&workbook_part, workbook_xml)?;
        let rels = relationships_of(&package, &workbook_part)?;

        let mut sheets = Vec::with_capacity(entries.len());
        for entry in entries {
            let rel = rels
                .iter()
                .find(|r| r.id == entry.rel_id)
                .ok_or_else(|| EngineError::Malformed {
                    part: workbook_part.clone(),
                    reason: format!("sheet '{}' has no relationship {}", entry.name, entry.rel_id),
                })?;
            sheets.push(SheetPart {
                name: entry.name,
                part: resolve_target(&workbook_part, &rel.target),
            });
        }
        debug!("Opened {} with {} sheet(s)", path.display(), sheets.len());

        Ok(OoxmlWorkbook {
            path: path.to_path_buf(),
            package,
            workbook_part,
            sheets,
            scans: RefCell::new(HashMap::new()),
            read_only: options.read_only,
            lock,
        })
    }

    fn sheet_part(&self, index: usize) -> Result<&SheetPart, EngineError> {
        self.sheets.get(index).ok_or(EngineError::NoSuchSheet(index))
    }

    fn scan(&self, index: usize) -> Result<Rc<SheetScan>, EngineError> {
        if let Some(scan) = self.scans.borrow().get(&index) {
            return Ok(Rc::clone(scan));
        }
        let sheet = self.sheet_part(index)?;
        let xml = self.package.require(&sheet.part)?;
        let scan = Rc::new(scan_sheet(&sheet.part, xml)?);
        self.scans.borrow_mut().insert(index, Rc::clone(&scan));
        Ok(scan)
    }

    fn sheet_relationships(&self, index: usize) -> Result<Vec<Relationship>, EngineError> {
        let sheet = self.sheet_part(index)?;
        relationships_of(&self.package, &sheet.part)
    }

    fn workbook_relationships(&self) -> Result<Vec<Relationship>, EngineError> {
        relationships_of(&self.package, &self.workbook_part)
    }

    /// Removes the macro project and everything hanging off it.
    fn strip_vba_project(&mut self) -> Result<(), EngineError> {
        let vba_parts: Vec<String> = self
            .workbook_relationships()?
            .iter()
            .filter(|r| r.is("vbaProject"))
            .map(|r| resolve_target(&self.workbook_part, &r.target))
            .collect();
        for part in &vba_parts {
            let dependents: Vec<String> = relationships_of(&self.package, part)?
                .iter()
                .filter(|r| !r.external)
                .map(|r| resolve_target(part, &r.target))
                .collect();
            for dependent in dependents {
                self.package.remove_part(&dependent);
                remove_content_type_override(&mut self.package, &dependent)?;
            }
            self.package.remove_part(&package::rels_path_for(part));
            self.package.remove_part(part);
            remove_content_type_override(&mut self.package, part)?;
        }
        let workbook_part = self.workbook_part.clone();
        remove_relationships(&mut self.package, &workbook_part, |r| r.is("vbaProject"))?;
        Ok(())
    }

    fn write(&mut self, target: &Path) -> Result<(), EngineError> {
        self.package.write_to(target)?;
        info!("Saved {}", target.display());
        Ok(())
    }
}

impl Workbook for OoxmlWorkbook {
    fn sheet_names(&self) -> Vec<String> {
        self.sheets.iter().map(|s| s.name.clone()).collect()
    }

    fn used_range(&self, sheet: usize) -> Result<UsedRange, EngineError> {
        Ok(self.scan(sheet)?.used_range())
    }

    fn non_blank_count(&self, sheet: usize) -> Result<u64, EngineError> {
        Ok(self.scan(sheet)?.non_blank)
    }

    fn last_data_cell(&self, sheet: usize) -> Result<Option<CellRef>, EngineError> {
        Ok(self.scan(sheet)?.last_data)
    }

    fn formulas(&self, sheet: usize) -> Result<Vec<String>, EngineError> {
        Ok(self.scan(sheet)?.formulas.clone())
    }

    fn pivot_table_count(&self, sheet: usize) -> Result<usize, EngineError> {
        Ok(self
            .sheet_relationships(sheet)?
            .iter()
            .filter(|r| r.is("pivotTable"))
            .count())
    }

    fn shape_count(&self, sheet: usize) -> Result<usize, EngineError> {
        let owner = self.sheet_part(sheet)?.part.clone();
        let mut count = 0;
        for rel in self.sheet_relationships(sheet)?.iter().filter(|r| r.is("drawing")) {
            let part = resolve_target(&owner, &rel.target);
            count += count_anchors(&part, self.package.require(&part)?)?;
        }
        Ok(count)
    }

    fn has_vba_project(&self) -> Result<bool, EngineError> {
        let by_relationship = self
            .workbook_relationships()?
            .iter()
            .any(|r| r.is("vbaProject"));
        Ok(by_relationship || self.package.has_part("xl/vbaProject.bin"))
    }

    fn link_sources(&self) -> Result<Vec<String>, EngineError> {
        let mut sources = Vec::new();
        for rel in self
            .workbook_relationships()?
            .iter()
            .filter(|r| r.is("externalLink"))
        {
            let part = resolve_target(&self.workbook_part, &rel.target);
            let targets: Vec<String> = relationships_of(&self.package, &part)?
                .into_iter()
                .filter(|r| r.rel_type.contains("externalLinkPath"))
                .map(|r| r.target)
                .collect();
            if targets.is_empty() {
                sources.push(part);
            } else {
                sources.extend(targets);
            }
        }
        Ok(sources)
    }

    fn connection_count(&self) -> Result<usize, EngineError> {
        let mut count = 0;
        for rel in self
            .workbook_relationships()?
            .iter()
            .filter(|r| r.is("connections"))
        {
            let part = resolve_target(&self.workbook_part, &rel.target);
            count += count_elements(&part, self.package.require(&part)?, &[&b"connection"[..]])?;
        }
        Ok(count)
    }

    fn calculate_full(&mut self) -> Result<(), EngineError> {
        Err(EngineError::Unsupported(
            "formula evaluation in file-level workbooks".to_string(),
        ))
    }

    fn calculate_full_rebuild(&mut self) -> Result<(), EngineError> {
        let calc_chains: Vec<String> = self
            .workbook_relationships()?
            .iter()
            .filter(|r| r.is("calcChain"))
            .map(|r| resolve_target(&self.workbook_part, &r.target))
            .collect();
        for part in &calc_chains {
            self.package.remove_part(part);
            remove_content_type_override(&mut self.package, part)?;
        }
        let workbook_part = self.workbook_part.clone();
        remove_relationships(&mut self.package, &workbook_part, |r| r.is("calcChain"))?;

        let xml = self.package.require(&workbook_part)?;
        let rewritten = set_full_calc_on_load(&workbook_part, xml)?;
        self.package.set_part(&workbook_part, rewritten);
        debug!(
            "Dropped {} calculation chain part(s) from {}",
            calc_chains.len(),
            self.path.display()
        );
        Ok(())
    }

    fn delete_rows_after(&mut self, sheet: usize, last_row: u32) -> Result<u64, EngineError> {
        let part = self.sheet_part(sheet)?.part.clone();
        let xml = self.package.require(&part)?;
        let (rewritten, removed) = purge_rows_after(&part, xml, last_row)?;
        self.package.set_part(&part, rewritten);
        self.scans.borrow_mut().remove(&sheet);
        Ok(removed)
    }

    fn save(&mut self) -> Result<(), EngineError> {
        if self.read_only {
            return Err(EngineError::Unsupported(
                "saving a workbook opened read-only".to_string(),
            ));
        }
        let path = self.path.clone();
        self.write(&path)
    }

    fn save_as(&mut self, path: &Path, format: FileFormat) -> Result<(), EngineError> {
        let main_type = match format {
            FileFormat::Xlsx => MAIN_CONTENT_TYPE,
            FileFormat::Xlsm => MACRO_MAIN_CONTENT_TYPE,
            FileFormat::Xlsb | FileFormat::Xls => {
                return Err(EngineError::Unsupported(format!(
                    "writing .{} workbooks",
                    format.extension()
                )))
            }
        };
        let lock = if self.lock.is_some() && path != self.path {
            Some(LockMarker::acquire(path)?)
        } else {
            None
        };
        if format == FileFormat::Xlsx {
            self.strip_vba_project()?;
        }
        if self.package.has_part(CONTENT_TYPES) {
            let workbook_part = self.workbook_part.clone();
            set_content_type_override(&mut self.package, &workbook_part, main_type)?;
        }
        self.write(path)?;
        self.path = path.to_path_buf();
        self.read_only = false;
        if lock.is_some() {
            self.lock = lock;
        }
        Ok(())
    }

    fn close(mut self, save_changes: bool) -> Result<(), EngineError> {
        if save_changes {
            self.save()?;
        }
        debug!(
            "Closed {} ({} parts)",
            self.path.display(),
            self.package.part_names().count()
        );
        Ok(())
    }
}
