//! The narrow capability interface the auditor and repair executor use to
//! talk to a spreadsheet engine, plus the bundled adapters.

pub mod memory;
pub mod ooxml;

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("file is password protected or encrypted")]
    Encrypted,

    #[error("file is locked for editing: {}", .0.display())]
    Locked(PathBuf),

    #[error("not a readable workbook: {0}")]
    Corrupt(String),

    #[error("unsupported by this engine: {0}")]
    Unsupported(String),

    #[error("no sheet at index {0}")]
    NoSuchSheet(usize),

    #[error("malformed part {part}: {reason}")]
    Malformed { part: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Workbook file formats an engine can read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileFormat {
    Xlsx,
    Xlsm,
    Xlsb,
    Xls,
}

impl FileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::Xlsx => "xlsx",
            FileFormat::Xlsm => "xlsm",
            FileFormat::Xlsb => "xlsb",
            FileFormat::Xls => "xls",
        }
    }

    pub fn from_path(path: &Path) -> Option<FileFormat> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "xlsx" => Some(FileFormat::Xlsx),
            "xlsm" => Some(FileFormat::Xlsm),
            "xlsb" => Some(FileFormat::Xlsb),
            "xls" => Some(FileFormat::Xls),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    pub read_only: bool,
    pub update_links: bool,
}

impl OpenOptions {
    /// Read-only, never refreshing external links.
    pub fn audit() -> Self {
        Self {
            read_only: true,
            update_links: false,
        }
    }

    /// Full write access, links still left alone.
    pub fn repair() -> Self {
        Self {
            read_only: false,
            update_links: false,
        }
    }
}

/// 1-based cell coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CellRef {
    pub row: u32,
    pub col: u32,
}

/// The rectangle the engine considers in use, formatting included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsedRange {
    pub first: CellRef,
    pub last: CellRef,
}

impl UsedRange {
    pub fn rows(&self) -> u64 {
        u64::from(self.last.row.saturating_sub(self.first.row)) + 1
    }

    pub fn columns(&self) -> u64 {
        u64::from(self.last.col.saturating_sub(self.first.col)) + 1
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetSummary {
    pub processes_terminated: usize,
    pub working_set_trimmed: bool,
}

/// Starts engine instances. One instance serves a whole batch.
pub trait EngineLauncher {
    type Engine: SpreadsheetEngine;

    /// Clears state left behind by a previous crashed run.
    fn reset(&self) -> Result<ResetSummary, EngineError>;

    fn launch(&self) -> Result<Self::Engine, EngineError>;
}

pub trait SpreadsheetEngine {
    type Workbook: Workbook;

    /// Turns off visibility, alerts and macro prompts.
    fn suppress_interaction(&mut self) -> Result<(), EngineError>;

    fn open(&mut self, path: &Path, options: OpenOptions) -> Result<Self::Workbook, EngineError>;

    /// The binary workbook format conversions target. Engines that cannot
    /// write it fail `save_as` with `EngineError::Unsupported`.
    fn native_format(&self) -> FileFormat;

    fn quit(&mut self) -> Result<(), EngineError>;
}

/// An open workbook. Sheets are addressed by zero-based index.
pub trait Workbook {
    fn sheet_names(&self) -> Vec<String>;

    fn used_range(&self, sheet: usize) -> Result<UsedRange, EngineError>;

    fn non_blank_count(&self, sheet: usize) -> Result<u64, EngineError>;

    /// Last cell holding a value or formula, searching rows from the bottom.
    fn last_data_cell(&self, sheet: usize) -> Result<Option<CellRef>, EngineError>;

    fn formulas(&self, sheet: usize) -> Result<Vec<String>, EngineError>;

    fn pivot_table_count(&self, sheet: usize) -> Result<usize, EngineError>;

    fn shape_count(&self, sheet: usize) -> Result<usize, EngineError>;

    fn has_vba_project(&self) -> Result<bool, EngineError>;

    fn link_sources(&self) -> Result<Vec<String>, EngineError>;

    fn connection_count(&self) -> Result<usize, EngineError>;

    fn calculate_full(&mut self) -> Result<(), EngineError>;

    /// Full recalculation that also discards and rebuilds dependency data.
    fn calculate_full_rebuild(&mut self) -> Result<(), EngineError>;

    /// Deletes every row strictly below `last_row`. Returns rows removed.
    fn delete_rows_after(&mut self, sheet: usize, last_row: u32) -> Result<u64, EngineError>;

    fn save(&mut self) -> Result<(), EngineError>;

    fn save_as(&mut self, path: &Path, format: FileFormat) -> Result<(), EngineError>;

    fn close(self, save_changes: bool) -> Result<(), EngineError>;
}

/// Quits the wrapped engine when dropped, so a batch never leaks an
/// engine instance whichever way it ends.
pub struct EngineGuard<E: SpreadsheetEngine> {
    engine: E,
}

impl<E: SpreadsheetEngine> EngineGuard<E> {
    pub fn new(engine: E) -> Self {
        Self { engine }
    }

    pub fn engine(&mut self) -> &mut E {
        &mut self.engine
    }
}

impl<E: SpreadsheetEngine> Drop for EngineGuard<E> {
    fn drop(&mut self) {
        match self.engine.quit() {
            Ok(()) => debug!("Spreadsheet engine stopped"),
            Err(e) => error!("Error stopping spreadsheet engine: {}", e),
        }
    }
}

/// Launches an engine and switches off interactive prompts. Either step
/// failing means the batch cannot run.
pub fn start_engine<L: EngineLauncher>(launcher: &L) -> Result<EngineGuard<L::Engine>, EngineError> {
    let engine = launcher.launch()?;
    let mut guard = EngineGuard::new(engine);
    guard.engine().suppress_interaction()?;
    Ok(guard)
}

/// Parses an A1-style reference such as `BC12` or `$A$1`.
pub fn parse_cell_ref(text: &str) -> Option<CellRef> {
    let text = text.trim();
    let mut col: u32 = 0;
    let mut row: u32 = 0;
    let mut seen_digit = false;
    for ch in text.chars() {
        match ch {
            '$' => continue,
            'A'..='Z' | 'a'..='z' if !seen_digit => {
                let v = (ch.to_ascii_uppercase() as u32) - ('A' as u32) + 1;
                col = col.checked_mul(26)?.checked_add(v)?;
            }
            '0'..='9' => {
                seen_digit = true;
                row = row.checked_mul(10)?.checked_add(ch.to_digit(10)?)?;
            }
            _ => return None,
        }
    }
    if col == 0 || row == 0 {
        return None;
    }
    Some(CellRef { row, col })
}

/// Parses `A1:D20` or a single cell `A1`.
pub fn parse_range_ref(text: &str) -> Option<UsedRange> {
    match text.split_once(':') {
        Some((a, b)) => {
            let first = parse_cell_ref(a)?;
            let last = parse_cell_ref(b)?;
            Some(UsedRange {
                first: CellRef {
                    row: first.row.min(last.row),
                    col: first.col.min(last.col),
                },
                last: CellRef {
                    row: first.row.max(last.row),
                    col: first.col.max(last.col),
                },
            })
        }
        None => {
            let cell = parse_cell_ref(text)?;
            Some(UsedRange {
                first: cell,
                last: cell,
            })
        }
    }
}

pub fn column_letters(mut col: u32) -> String {
    let mut letters = Vec::new();
    while col > 0 {
        let rem = (col - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        col = (col - 1) / 26;
    }
    letters.iter().rev().collect()
}

pub fn format_range_ref(range: &UsedRange) -> String {
    let first = format!("{}{}", column_letters(range.first.col), range.first.row);
    if range.first == range.last {
        return first;
    }
    format!(
        "{}:{}{}",
        first,
        column_letters(range.last.col),
        range.last.row
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cell_ref() {
        assert_eq!(parse_cell_ref("A1"), Some(CellRef { row: 1, col: 1 }));
        assert_eq!(parse_cell_ref("$AB$12"), Some(CellRef { row: 12, col: 28 }));
        assert_eq!(parse_cell_ref("XFD1048576"), Some(CellRef { row: 1_048_576, col: 16_384 }));
        assert_eq!(parse_cell_ref("12"), None);
        assert_eq!(parse_cell_ref("A"), None);
        assert_eq!(parse_cell_ref("A1B"), None);
    }

    #[test]
    fn test_parse_range_ref_and_counts() {
        let range = parse_range_ref("B2:D6000").unwrap();
        assert_eq!(range.rows(), 5999);
        assert_eq!(range.columns(), 3);

        let single = parse_range_ref("A1").unwrap();
        assert_eq!(single.rows(), 1);
        assert_eq!(single.columns(), 1);
    }

    #[test]
    fn test_format_range_ref() {
        assert_eq!(column_letters(1), "A");
        assert_eq!(column_letters(27), "AA");
        assert_eq!(column_letters(16_384), "XFD");
        let range = parse_range_ref("A1:AA100").unwrap();
        assert_eq!(format_range_ref(&range), "A1:AA100");
        assert_eq!(format_range_ref(&parse_range_ref("C3").unwrap()), "C3");
    }

    #[test]
    fn test_file_format_from_path() {
        assert_eq!(FileFormat::from_path(Path::new("a/b.XLSX")), Some(FileFormat::Xlsx));
        assert_eq!(FileFormat::from_path(Path::new("b.xlsb")), Some(FileFormat::Xlsb));
        assert_eq!(FileFormat::from_path(Path::new("b.csv")), None);
        assert_eq!(FileFormat::from_path(Path::new("noext")), None);
    }
}
