//! Threshold rules that turn raw workbook signals into issues.
//!
//! Everything here is pure: the auditor gathers the signals from the
//! engine and these functions decide what is wrong with them.

use crate::config::{AppConfig, PhantomPolicy, Thresholds};
use crate::model::{Issue, SheetSignal};
use lazy_static::lazy_static;
use regex::Regex;
use std::time::Duration;

lazy_static! {
    static ref VOLATILE_CALL: Regex =
        Regex::new(r"(?i)(OFFSET|INDIRECT|TODAY|RAND)\(").unwrap();
    // `A:A`, `$B:$D`, `Sheet1!C:C`; not `A1:B2` and not a function call.
    static ref FULL_COLUMN_REF: Regex =
        Regex::new(r"(?i)(?:^|[^A-Z0-9_.$])\$?[A-Z]{1,3}:\$?[A-Z]{1,3}(?:[^A-Z0-9_(]|$)").unwrap();
}

/// True when any formula calls a volatile function.
pub fn has_volatile_call(formulas: &[String]) -> bool {
    VOLATILE_CALL.is_match(&formulas.join(" "))
}

/// True when any formula addresses whole columns.
pub fn has_full_column_reference(formulas: &[String]) -> bool {
    formulas.iter().any(|f| FULL_COLUMN_REF.is_match(f))
}

/// Workbook-wide measurements; `None` marks a read the engine could not
/// perform.
#[derive(Debug, Clone, Default)]
pub struct WorkbookSignal {
    pub has_vba: Option<bool>,
    pub link_count: Option<usize>,
    pub connection_count: Option<usize>,
    pub extension: String,
    pub native_extension: String,
    pub size_bytes: u64,
    pub open_duration: Duration,
    pub calculation_duration: Option<Duration>,
}

pub fn phantom_rows(signal: &SheetSignal, thresholds: &Thresholds) -> Option<Issue> {
    let used_rows = signal.used_rows?;
    let flagged = match thresholds.phantom_policy {
        PhantomPolicy::Slack => {
            let real_data = signal.real_data_cells?;
            used_rows > real_data.saturating_add(thresholds.phantom_slack_rows)
        }
        PhantomPolicy::Ratio => {
            let last_row = signal.last_data_row?;
            last_row > thresholds.phantom_ratio_min_rows && used_rows.saturating_mul(2) < last_row
        }
    };
    if !flagged {
        return None;
    }
    Some(Issue::PhantomRows {
        sheet: signal.name.clone(),
        used_rows,
        real_data: signal
            .real_data_cells
            .or(signal.last_data_row)
            .unwrap_or(0),
    })
}

pub fn sheet_issues(signal: &SheetSignal, thresholds: &Thresholds) -> Vec<Issue> {
    let mut issues = Vec::new();
    let sheet = || signal.name.clone();

    issues.extend(phantom_rows(signal, thresholds));
    if let Some(used_rows) = signal.used_rows.filter(|r| *r > thresholds.row_bloat_rows) {
        issues.push(Issue::RowBloat {
            sheet: sheet(),
            used_rows,
        });
    }
    if let Some(used_columns) = signal
        .used_columns
        .filter(|c| *c > thresholds.column_bloat_columns)
    {
        issues.push(Issue::ColumnBloat {
            sheet: sheet(),
            used_columns,
        });
    }
    if signal.has_pivot_tables() {
        issues.push(Issue::PivotCacheBloat { sheet: sheet() });
    }
    if signal.volatile_match == Some(true) {
        issues.push(Issue::VolatileFormulas { sheet: sheet() });
    }
    if signal.full_column_match == Some(true) {
        issues.push(Issue::FullColumnReferences { sheet: sheet() });
    }
    if let Some(count) = signal
        .formula_count
        .filter(|c| *c > thresholds.heavy_formula_count)
    {
        issues.push(Issue::HeavyFormulas {
            sheet: sheet(),
            count,
        });
    }
    if let Some(count) = signal.shape_count.filter(|c| *c > thresholds.shape_count) {
        issues.push(Issue::ExcessShapes {
            sheet: sheet(),
            count,
        });
    }
    issues
}

pub fn workbook_issues(signal: &WorkbookSignal, config: &AppConfig) -> Vec<Issue> {
    let mut issues = Vec::new();
    let thresholds = &config.thresholds;

    if signal.has_vba == Some(true) {
        issues.push(Issue::VbaPresent);
    }
    if let Some(count) = signal.link_count.filter(|c| *c > 0) {
        issues.push(Issue::ExternalLinks { count });
    }
    if let Some(count) = signal.connection_count.filter(|c| *c > 0) {
        issues.push(Issue::DataConnections { count });
    }
    if config.checks.legacy_format && !signal.extension.eq_ignore_ascii_case(&signal.native_extension) {
        issues.push(Issue::LegacyFormat {
            extension: signal.extension.to_ascii_lowercase(),
        });
    }
    let size_mb = signal.size_bytes as f64 / (1024.0 * 1024.0);
    if size_mb > thresholds.large_file_mb {
        issues.push(Issue::LargeFile { size_mb });
    }

    let open_secs = signal.open_duration.as_secs_f64();
    if open_secs > thresholds.slow_load_secs {
        issues.push(Issue::SlowLoad { seconds: open_secs });
    }
    if let Some(calc_secs) = signal
        .calculation_duration
        .map(|d| d.as_secs_f64())
        .filter(|s| *s > thresholds.slow_calc_secs)
    {
        issues.push(Issue::SlowCalculation { seconds: calc_secs });
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet(used_rows: u64, real_data: u64, last_row: u64) -> SheetSignal {
        SheetSignal {
            name: "Data".to_string(),
            used_rows: Some(used_rows),
            used_columns: Some(4),
            real_data_cells: Some(real_data),
            last_data_row: Some(last_row),
            ..Default::default()
        }
    }

    fn native(extension: &str) -> WorkbookSignal {
        WorkbookSignal {
            extension: extension.to_string(),
            native_extension: "xlsb".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_volatile_detection_is_case_insensitive() {
        assert!(has_volatile_call(&["SUM(A1:A4)".to_string(), "offset(A1,1,0)".to_string()]));
        assert!(has_volatile_call(&["=Today()+1".to_string()]));
        assert!(!has_volatile_call(&["SUM(A1:A4)".to_string(), "RANDOM_NAME".to_string()]));
        assert!(!has_volatile_call(&[]));
    }

    #[test]
    fn test_full_column_detection() {
        assert!(has_full_column_reference(&["SUM(A:A)".to_string()]));
        assert!(has_full_column_reference(&["VLOOKUP(x,Sheet2!$B:$D,2,0)".to_string()]));
        assert!(!has_full_column_reference(&["SUM(A1:A100)".to_string()]));
        assert!(!has_full_column_reference(&["SUM(1:1)".to_string(), "TODAY()".to_string()]));
    }

    #[test]
    fn test_heavy_formula_load() {
        let mut signal = sheet(100, 100, 100);
        signal.formula_count = Some(5001);
        let issues = sheet_issues(&signal, &Thresholds::default());
        assert_eq!(
            issues,
            vec![Issue::HeavyFormulas {
                sheet: "Data".to_string(),
                count: 5001
            }]
        );
        signal.formula_count = Some(5000);
        assert!(sheet_issues(&signal, &Thresholds::default()).is_empty());
    }

    #[test]
    fn test_large_file() {
        let config = AppConfig::default();
        let signal = WorkbookSignal {
            size_bytes: 21 * 1024 * 1024,
            ..native("xlsb")
        };
        assert_eq!(workbook_issues(&signal, &config), vec![Issue::LargeFile { size_mb: 21.0 }]);
        let small = WorkbookSignal {
            size_bytes: 20 * 1024 * 1024,
            ..native("xlsb")
        };
        assert!(workbook_issues(&small, &config).is_empty());
    }

    #[test]
    fn test_slack_policy() {
        let thresholds = Thresholds::default();
        let issue = phantom_rows(&sheet(6000, 100, 100), &thresholds).unwrap();
        assert_eq!(
            issue,
            Issue::PhantomRows {
                sheet: "Data".to_string(),
                used_rows: 6000,
                real_data: 100
            }
        );
        assert!(phantom_rows(&sheet(5100, 100, 100), &thresholds).is_none());
    }

    #[test]
    fn test_ratio_policy() {
        let thresholds = Thresholds {
            phantom_policy: PhantomPolicy::Ratio,
            ..Default::default()
        };
        // Used range far shorter than the last data row index.
        assert!(phantom_rows(&sheet(501, 400, 9500), &thresholds).is_some());
        assert!(phantom_rows(&sheet(12_000, 100, 100), &thresholds).is_none());
        assert!(phantom_rows(&sheet(4749, 100, 9500), &thresholds).is_some());
        assert!(phantom_rows(&sheet(4750, 100, 9500), &thresholds).is_none());
        assert!(phantom_rows(&sheet(10, 10, 5000), &thresholds).is_none());
    }

    #[test]
    fn test_missing_signals_skip_rules() {
        let signal = SheetSignal {
            name: "Blind".to_string(),
            ..Default::default()
        };
        assert!(sheet_issues(&signal, &Thresholds::default()).is_empty());
    }

    #[test]
    fn test_sheet_issue_order() {
        let signal = SheetSignal {
            name: "Big".to_string(),
            used_rows: Some(20_000),
            used_columns: Some(60),
            real_data_cells: Some(10),
            last_data_row: Some(10),
            formula_count: Some(1),
            pivot_table_count: Some(1),
            shape_count: Some(11),
            volatile_match: Some(true),
            full_column_match: Some(true),
        };
        let thresholds = Thresholds {
            heavy_formula_count: 0,
            ..Default::default()
        };
        let kinds: Vec<_> = sheet_issues(&signal, &thresholds)
            .iter()
            .map(|i| i.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "phantom_rows",
                "row_bloat",
                "column_bloat",
                "pivot_cache_bloat",
                "volatile_formulas",
                "full_column_references",
                "heavy_formulas",
                "excess_shapes"
            ]
        );
    }

    #[test]
    fn test_workbook_issues() {
        let config = AppConfig::default();
        assert!(workbook_issues(&native("XLSB"), &config).is_empty());

        let signal = WorkbookSignal {
            has_vba: Some(true),
            link_count: Some(2),
            connection_count: Some(0),
            open_duration: Duration::from_secs(6),
            calculation_duration: Some(Duration::from_millis(1500)),
            ..native("xlsm")
        };
        let issues = workbook_issues(&signal, &config);
        assert_eq!(issues[0], Issue::VbaPresent);
        assert_eq!(issues[1], Issue::ExternalLinks { count: 2 });
        assert_eq!(
            issues[2],
            Issue::LegacyFormat {
                extension: "xlsm".to_string()
            }
        );
        assert!(matches!(issues[3], Issue::SlowLoad { .. }));
        assert!(matches!(issues[4], Issue::SlowCalculation { .. }));
        assert_eq!(issues.len(), 5);
    }

    #[test]
    fn test_legacy_check_can_be_disabled() {
        let mut config = AppConfig::default();
        config.checks.legacy_format = false;
        assert!(workbook_issues(&native("xls"), &config).is_empty());
    }
}
