//! Rendering of audit and repair results: a colored console table, JSON
//! and CSV.

use crate::error::Error;
use crate::model::{Health, WorkbookReport};
use crate::repair::{RepairOutcome, RepairStatus};
use chrono::{DateTime, Utc};
use colored::*;
use indicatif::HumanBytes;
use serde::Serialize;
use std::fmt::Write as _;
use std::io::Write;

const CSV_HEADERS: [&str; 7] = ["file_name", "path", "size_mb", "health", "issue", "reason", "fix"];

fn health_label(health: Health) -> ColoredString {
    let label = health.to_string();
    match health {
        Health::Stable => label.green(),
        Health::Degraded => label.yellow(),
        Health::Critical => label.red().bold(),
    }
}

pub fn render_table(reports: &[WorkbookReport]) -> String {
    let mut out = String::new();
    for report in reports {
        let _ = writeln!(
            out,
            "{} {} ({})",
            health_label(report.health),
            report.file_name.bold(),
            HumanBytes(report.size_bytes)
        );
        if let Some(open) = report.open_duration {
            let _ = write!(out, "    opened in {:.2}s", open.as_secs_f64());
            if let Some(calc) = report.calculation_duration {
                let _ = write!(out, ", recalculated in {:.2}s", calc.as_secs_f64());
            }
            out.push('\n');
        }
        for issue in &report.issues {
            let _ = writeln!(out, "  - {}", issue.reason());
            let _ = writeln!(out, "    {} {}", "fix:".dimmed(), issue.fix().describe());
        }
    }

    let count = |health: Health| reports.iter().filter(|r| r.health == health).count();
    let _ = writeln!(
        out,
        "{} workbook(s): {} stable, {} degraded, {} critical",
        reports.len(),
        count(Health::Stable).to_string().green(),
        count(Health::Degraded).to_string().yellow(),
        count(Health::Critical).to_string().red()
    );
    out
}

#[derive(Serialize)]
struct JsonDocument<'a> {
    generated_at: DateTime<Utc>,
    reports: &'a [WorkbookReport],
}

pub fn write_json<W: Write>(reports: &[WorkbookReport], writer: W) -> Result<(), Error> {
    let document = JsonDocument {
        generated_at: Utc::now(),
        reports,
    };
    serde_json::to_writer_pretty(writer, &document)?;
    Ok(())
}

/// One row per issue; a clean workbook still gets a row with empty issue
/// columns.
pub fn write_csv<W: Write>(reports: &[WorkbookReport], writer: W) -> Result<(), Error> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(CSV_HEADERS)?;

    for report in reports {
        let path = report.path.to_string_lossy().into_owned();
        let size_mb = format!("{:.2}", report.size_mb());
        let health = report.health.to_string();
        if report.issues.is_empty() {
            wtr.write_record([
                report.file_name.as_str(),
                path.as_str(),
                size_mb.as_str(),
                health.as_str(),
                "",
                "",
                "",
            ])?;
            continue;
        }
        for issue in &report.issues {
            wtr.write_record([
                report.file_name.as_str(),
                path.as_str(),
                size_mb.as_str(),
                health.as_str(),
                issue.kind(),
                issue.reason().as_str(),
                issue.fix().describe(),
            ])?;
        }
    }
    wtr.flush()?;
    Ok(())
}

fn status_label(status: RepairStatus) -> ColoredString {
    let label = status.to_string();
    match status {
        RepairStatus::Repaired => label.green(),
        RepairStatus::Partial => label.yellow(),
        RepairStatus::Failed => label.red().bold(),
    }
}

pub fn render_repair_table(outcomes: &[RepairOutcome]) -> String {
    let mut out = String::new();
    for outcome in outcomes {
        let _ = writeln!(
            out,
            "{} {}",
            status_label(outcome.status()),
            outcome.path.display().to_string().bold()
        );
        if outcome.rows_deleted > 0 {
            let _ = writeln!(out, "  - {} ghost row(s) deleted", outcome.rows_deleted);
        }
        if let Some(output) = &outcome.output {
            let _ = writeln!(out, "  - saved as {}", output.display());
        }
        if !outcome.discarded.is_empty() {
            let steps: Vec<String> = outcome
                .discarded
                .iter()
                .map(|step| step.action().to_string())
                .collect();
            let _ = writeln!(out, "  - {} {}", "not saved:".red(), steps.join(", "));
        }
        if let Some(failure) = &outcome.failure {
            let _ = writeln!(
                out,
                "  - {} {:?}: {}",
                "failed at".red(),
                failure.stage,
                failure.reason
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AuditTarget, Issue};
    use std::path::PathBuf;
    use std::time::Duration;

    fn reports() -> Vec<WorkbookReport> {
        let clean = AuditTarget {
            path: PathBuf::from("clean.xlsb"),
            size_bytes: 1024,
        };
        let ghost = AuditTarget {
            path: PathBuf::from("ghost.xlsx"),
            size_bytes: 3 * 1024 * 1024,
        };
        vec![
            WorkbookReport::from_scan(&clean, vec![], vec![], Duration::from_millis(20), None),
            WorkbookReport::from_scan(
                &ghost,
                vec![],
                vec![
                    Issue::PhantomRows {
                        sheet: "Data".to_string(),
                        used_rows: 6000,
                        real_data: 100,
                    },
                    Issue::VbaPresent,
                ],
                Duration::from_millis(20),
                None,
            ),
        ]
    }

    #[test]
    fn test_table_lists_issues_and_fixes() {
        colored::control::set_override(false);
        let table = render_table(&reports());
        assert!(table.contains("Stable clean.xlsb"));
        assert!(table.contains("Degraded ghost.xlsx"));
        assert!(table.contains("6000 rows"));
        assert!(table.contains("Delete the unused rows"));
        assert!(table.contains("2 workbook(s): 1 stable, 1 degraded, 0 critical"));
    }

    #[test]
    fn test_json_document() {
        let mut buf = Vec::new();
        write_json(&reports(), &mut buf).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert!(value["generated_at"].is_string());
        assert_eq!(value["reports"].as_array().unwrap().len(), 2);
        assert_eq!(value["reports"][1]["issues"][0]["kind"], "phantom_rows");
    }

    #[test]
    fn test_csv_has_one_row_per_issue() {
        let mut buf = Vec::new();
        write_csv(&reports(), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "file_name,path,size_mb,health,issue,reason,fix");
        assert!(lines[1].starts_with("clean.xlsb,clean.xlsb,0.00,Stable,,,"));
        assert!(lines[2].contains("phantom_rows"));
        assert!(lines[3].contains("vba_present"));
    }

    #[test]
    fn test_repair_table_marks_unsaved_steps() {
        use crate::repair::{RepairFailure, RepairStage, RepairStep};

        colored::control::set_override(false);
        let outcome = RepairOutcome {
            path: PathBuf::from("ghost.xlsx"),
            completed: vec![],
            discarded: vec![RepairStep::PurgeGhostRows { rows_deleted: 5900 }],
            failure: Some(RepairFailure {
                stage: RepairStage::Save,
                reason: "disk full".to_string(),
            }),
            output: None,
            rows_deleted: 0,
        };
        let table = render_repair_table(&[outcome]);
        assert!(table.starts_with("Failed ghost.xlsx"));
        assert!(table.contains("not saved: purge ghost rows"));
        assert!(!table.contains("ghost row(s) deleted"));
        assert!(table.contains("failed at Save: disk full"));
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }
    }

    #[test]
    fn test_csv_write_failure_is_an_io_error() {
        assert!(matches!(write_csv(&reports(), BrokenPipe), Err(Error::Io(_))));
    }

    #[test]
    fn test_json_output_is_a_single_document() {
        let mut buf = Vec::new();
        write_json(&reports(), &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with('{'));
        assert!(text.trim_end().ends_with('}'));
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["reports"][0]["health"], "Stable");
    }
}
