use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub const WORKBOOK_EXTENSIONS: [&str; 4] = ["xlsx", "xlsm", "xlsb", "xls"];

/// Spreadsheet extension, and not an owner lock marker (`~$name`).
pub fn is_workbook(path: &Path) -> bool {
    let is_lock_marker = path
        .file_name()
        .and_then(|n| n.to_str())
        .map_or(false, |n| n.starts_with("~$"));
    let has_extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| {
            WORKBOOK_EXTENSIONS
                .iter()
                .any(|w| w.eq_ignore_ascii_case(e))
        });
    has_extension && !is_lock_marker
}

fn is_pattern(input: &str) -> bool {
    input.contains(|c: char| matches!(c, '*' | '?' | '['))
}

/// Expands files, directories and glob patterns into a de-duplicated
/// list of workbook paths, in input order.
///
/// Explicit file paths are kept as given, even when missing, so that the
/// audit reports them instead of silently dropping them.
pub fn expand_inputs(inputs: &[String]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut paths = Vec::new();
    let mut push = |path: PathBuf| {
        if seen.insert(path.clone()) {
            paths.push(path);
        }
    };

    for input in inputs {
        if is_pattern(input) {
            match glob::glob(input) {
                Ok(entries) => entries
                    .filter_map(|entry| match entry {
                        Ok(path) => Some(path),
                        Err(e) => {
                            warn!("Skipping unreadable match for '{}': {}", input, e);
                            None
                        }
                    })
                    .filter(|p| p.is_file() && is_workbook(p))
                    .for_each(&mut push),
                Err(e) => warn!("Invalid glob pattern '{}': {}", input, e),
            }
            continue;
        }

        let path = PathBuf::from(input);
        if path.is_dir() {
            debug!("Walking {}", path.display());
            WalkDir::new(&path)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!("Error walking {}: {}", path.display(), e);
                        None
                    }
                })
                .filter(|entry| entry.file_type().is_file() && is_workbook(entry.path()))
                .for_each(|entry| push(entry.into_path()));
        } else {
            push(path);
        }
    }
    paths
}
