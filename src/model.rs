use serde::{Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A workbook selected for auditing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditTarget {
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl AuditTarget {
    pub fn new(path: &Path) -> Self {
        let size_bytes = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        Self {
            path: path.to_path_buf(),
            size_bytes,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }
}

/// Measurements taken from one sheet. `None` means the engine could not
/// supply that signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SheetSignal {
    pub name: String,
    pub used_rows: Option<u64>,
    pub used_columns: Option<u64>,
    pub real_data_cells: Option<u64>,
    pub last_data_row: Option<u64>,
    pub formula_count: Option<u64>,
    pub pivot_table_count: Option<u64>,
    pub shape_count: Option<u64>,
    pub volatile_match: Option<bool>,
    pub full_column_match: Option<bool>,
}

impl SheetSignal {
    pub fn has_pivot_tables(&self) -> bool {
        self.pivot_table_count.unwrap_or(0) > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Health {
    Stable,
    Degraded,
    Critical,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Health::Stable => "Stable",
            Health::Degraded => "Degraded",
            Health::Critical => "Critical",
        };
        f.write_str(label)
    }
}

/// What kind of action resolves an issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FixCategory {
    PurgeGhostRows,
    ConvertToBinary,
    RebuildCalculationChain,
    ManualReview,
}

impl FixCategory {
    pub fn describe(&self) -> &'static str {
        match self {
            FixCategory::PurgeGhostRows => "Delete the unused rows below the last data row.",
            FixCategory::ConvertToBinary => "Save a copy in the compact binary workbook format.",
            FixCategory::RebuildCalculationChain => {
                "Force a full recalculation and rebuild the dependency chain."
            }
            FixCategory::ManualReview => "Review manually; no automatic repair applies.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Issue {
    FileAccess { reason: String },
    PhantomRows { sheet: String, used_rows: u64, real_data: u64 },
    RowBloat { sheet: String, used_rows: u64 },
    ColumnBloat { sheet: String, used_columns: u64 },
    PivotCacheBloat { sheet: String },
    VolatileFormulas { sheet: String },
    FullColumnReferences { sheet: String },
    HeavyFormulas { sheet: String, count: u64 },
    ExcessShapes { sheet: String, count: u64 },
    VbaPresent,
    ExternalLinks { count: usize },
    DataConnections { count: usize },
    SlowLoad { seconds: f64 },
    SlowCalculation { seconds: f64 },
    LegacyFormat { extension: String },
    LargeFile { size_mb: f64 },
}

impl Issue {
    /// Stable snake_case name, the same as the serialized `kind` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Issue::FileAccess { .. } => "file_access",
            Issue::PhantomRows { .. } => "phantom_rows",
            Issue::RowBloat { .. } => "row_bloat",
            Issue::ColumnBloat { .. } => "column_bloat",
            Issue::PivotCacheBloat { .. } => "pivot_cache_bloat",
            Issue::VolatileFormulas { .. } => "volatile_formulas",
            Issue::FullColumnReferences { .. } => "full_column_references",
            Issue::HeavyFormulas { .. } => "heavy_formulas",
            Issue::ExcessShapes { .. } => "excess_shapes",
            Issue::VbaPresent => "vba_present",
            Issue::ExternalLinks { .. } => "external_links",
            Issue::DataConnections { .. } => "data_connections",
            Issue::SlowLoad { .. } => "slow_load",
            Issue::SlowCalculation { .. } => "slow_calculation",
            Issue::LegacyFormat { .. } => "legacy_format",
            Issue::LargeFile { .. } => "large_file",
        }
    }

    pub fn reason(&self) -> String {
        match self {
            Issue::FileAccess { reason } => format!("Access error: {}", reason),
            Issue::PhantomRows {
                sheet,
                used_rows,
                real_data,
            } => format!(
                "Ghost data in '{}': sheet uses {} rows for only {} entries.",
                sheet, used_rows, real_data
            ),
            Issue::RowBloat { sheet, used_rows } => {
                format!("Row bloat in '{}': {} rows in the used range.", sheet, used_rows)
            }
            Issue::ColumnBloat {
                sheet,
                used_columns,
            } => format!(
                "Wide column range in '{}': {} columns in the used range.",
                sheet, used_columns
            ),
            Issue::PivotCacheBloat { sheet } => format!(
                "Pivot cache bloat in '{}': pivot tables duplicate their source data.",
                sheet
            ),
            Issue::VolatileFormulas { sheet } => format!(
                "Volatile formulas in '{}': OFFSET, INDIRECT, TODAY or RAND recalculate on every change.",
                sheet
            ),
            Issue::FullColumnReferences { sheet } => format!(
                "Full column references in '{}': formulas address entire columns.",
                sheet
            ),
            Issue::HeavyFormulas { sheet, count } => {
                format!("Heavy formula load in '{}': {} formulas.", sheet, count)
            }
            Issue::ExcessShapes { sheet, count } => {
                format!("Excess objects in '{}': {} shapes on the sheet.", sheet, count)
            }
            Issue::VbaPresent => "VBA project present: macros can carry security risk.".to_string(),
            Issue::ExternalLinks { count } => {
                format!("External links: workbook depends on {} external source(s).", count)
            }
            Issue::DataConnections { count } => {
                format!("Data connections: {} external connection(s) defined.", count)
            }
            Issue::SlowLoad { seconds } => format!("Slow load: opening took {:.2}s.", seconds),
            Issue::SlowCalculation { seconds } => {
                format!("Slow calculation: full recalculation took {:.2}s.", seconds)
            }
            Issue::LegacyFormat { extension } => format!(
                "Format: '.{}' is not the engine's binary workbook format.",
                extension
            ),
            Issue::LargeFile { size_mb } => {
                format!("High disk footprint: {:.1} MB on disk.", size_mb)
            }
        }
    }

    pub fn fix(&self) -> FixCategory {
        match self {
            Issue::PhantomRows { .. } | Issue::RowBloat { .. } => FixCategory::PurgeGhostRows,
            Issue::SlowCalculation { .. } | Issue::VolatileFormulas { .. } => {
                FixCategory::RebuildCalculationChain
            }
            Issue::LegacyFormat { .. }
            | Issue::LargeFile { .. }
            | Issue::SlowLoad { .. }
            | Issue::PivotCacheBloat { .. } => FixCategory::ConvertToBinary,
            Issue::FileAccess { .. }
            | Issue::ColumnBloat { .. }
            | Issue::FullColumnReferences { .. }
            | Issue::HeavyFormulas { .. }
            | Issue::ExcessShapes { .. }
            | Issue::VbaPresent
            | Issue::ExternalLinks { .. }
            | Issue::DataConnections { .. } => FixCategory::ManualReview,
        }
    }

    /// Timing issues depend on machine load and are not reproducible.
    pub fn is_timing(&self) -> bool {
        matches!(self, Issue::SlowLoad { .. } | Issue::SlowCalculation { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkbookReport {
    pub file_name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub health: Health,
    pub issues: Vec<Issue>,
    pub sheets: Vec<SheetSignal>,
    #[serde(rename = "open_secs", serialize_with = "as_secs")]
    pub open_duration: Option<Duration>,
    #[serde(rename = "calculation_secs", serialize_with = "as_secs")]
    pub calculation_duration: Option<Duration>,
}

fn as_secs<S: Serializer>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match duration {
        Some(d) => serializer.serialize_some(&d.as_secs_f64()),
        None => serializer.serialize_none(),
    }
}

impl WorkbookReport {
    /// A report for a workbook that could not be opened.
    pub fn critical(target: &AuditTarget, reason: String) -> Self {
        Self {
            file_name: target.file_name(),
            path: target.path.clone(),
            size_bytes: target.size_bytes,
            health: Health::Critical,
            issues: vec![Issue::FileAccess { reason }],
            sheets: Vec::new(),
            open_duration: None,
            calculation_duration: None,
        }
    }

    pub fn from_scan(
        target: &AuditTarget,
        sheets: Vec<SheetSignal>,
        issues: Vec<Issue>,
        open_duration: Duration,
        calculation_duration: Option<Duration>,
    ) -> Self {
        let health = if issues.is_empty() {
            Health::Stable
        } else {
            Health::Degraded
        };
        Self {
            file_name: target.file_name(),
            path: target.path.clone(),
            size_bytes: target.size_bytes,
            health,
            issues,
            sheets,
            open_duration: Some(open_duration),
            calculation_duration,
        }
    }

    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> AuditTarget {
        AuditTarget {
            path: PathBuf::from("/data/q3/budget.xlsx"),
            size_bytes: 2 * 1024 * 1024,
        }
    }

    #[test]
    fn test_health_follows_issue_list() {
        let clean = WorkbookReport::from_scan(&target(), vec![], vec![], Duration::ZERO, None);
        assert_eq!(clean.health, Health::Stable);

        let degraded = WorkbookReport::from_scan(
            &target(),
            vec![],
            vec![Issue::VbaPresent],
            Duration::ZERO,
            None,
        );
        assert_eq!(degraded.health, Health::Degraded);

        let critical = WorkbookReport::critical(&target(), "password required".to_string());
        assert_eq!(critical.health, Health::Critical);
        assert_eq!(critical.issues.len(), 1);
        assert_eq!(critical.file_name, "budget.xlsx");
        assert!((critical.size_mb() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_issue_fix_categories() {
        let phantom = Issue::PhantomRows {
            sheet: "Data".to_string(),
            used_rows: 6000,
            real_data: 100,
        };
        assert_eq!(phantom.fix(), FixCategory::PurgeGhostRows);
        assert!(phantom.reason().contains("6000"));
        assert_eq!(
            Issue::LegacyFormat {
                extension: "xlsx".to_string()
            }
            .fix(),
            FixCategory::ConvertToBinary
        );
        assert_eq!(Issue::VbaPresent.fix(), FixCategory::ManualReview);
        assert_eq!(Issue::LargeFile { size_mb: 25.0 }.fix(), FixCategory::ConvertToBinary);
        assert_eq!(
            Issue::HeavyFormulas {
                sheet: "Calc".to_string(),
                count: 6000
            }
            .fix(),
            FixCategory::ManualReview
        );
        assert!(Issue::SlowLoad { seconds: 6.0 }.is_timing());
        assert!(!Issue::VbaPresent.is_timing());
    }

    #[test]
    fn test_issue_serializes_with_kind_tag() {
        let json = serde_json::to_string(&Issue::ExternalLinks { count: 2 }).unwrap();
        assert_eq!(json, r#"{"kind":"external_links","count":2}"#);
        assert_eq!(Issue::ExternalLinks { count: 2 }.kind(), "external_links");
    }

    #[test]
    fn test_report_durations_serialize_as_seconds() {
        let report = WorkbookReport::from_scan(
            &target(),
            vec![],
            vec![],
            Duration::from_millis(1500),
            None,
        );
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["open_secs"], serde_json::json!(1.5));
        assert!(value["calculation_secs"].is_null());
        assert_eq!(value["health"], "Stable");
    }
}
