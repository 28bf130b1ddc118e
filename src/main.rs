mod cli;
mod console;
mod logging;

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser};
use cli::{AuditArgs, Cli, Commands, OutputFormat, RepairArgs};
use colored::*;
use console::ConsoleProgress;
use dotenv::dotenv;
use tracing::{error, info, warn};
use workbook_auditor::config::load_configuration;
use workbook_auditor::engine::ooxml::OoxmlLauncher;
use workbook_auditor::engine::EngineLauncher;
use workbook_auditor::inputs::expand_inputs;
use workbook_auditor::{
    report, spawn_audit, spawn_repair, AppConfig, Error, RepairJob, RepairOutcome, WorkbookReport,
};

fn main() {
    dotenv().ok();

    let _guard = logging::init_logger();

    let config = match load_configuration() {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let args = Cli::parse();

    let result = match args.command {
        Some(Commands::Audit(args)) => run_audit(&args, config),
        Some(Commands::Repair(args)) => run_repair(&args, config),
        Some(Commands::Reset) => run_reset(&config),
        Some(Commands::PrintConfig) => print_config(&config),
        None => {
            let _ = Cli::command().print_long_help();
            Ok(())
        }
    };

    if let Err(err) = result {
        error!("Error: {:#}", err);
        process::exit(1);
    }
}

fn launcher(config: &AppConfig) -> OoxmlLauncher {
    OoxmlLauncher::new(config.engine.stale_process_names.clone())
}

fn select_workbooks(inputs: &[String]) -> Vec<PathBuf> {
    let paths = expand_inputs(inputs);
    if paths.is_empty() {
        warn!("No workbooks matched {:?}", inputs);
    } else {
        info!("{} workbook(s) selected", format!("{}", paths.len()).cyan());
    }
    paths
}

fn run_audit(args: &AuditArgs, mut config: AppConfig) -> anyhow::Result<()> {
    config.engine.reset_before_batch |= args.reset;
    let paths = select_workbooks(&args.paths);
    if paths.is_empty() {
        return Ok(());
    }
    let reports = audit_batch(paths, &config)?;
    emit_reports(&reports, args.format, args.output.as_deref())
}

fn audit_batch(paths: Vec<PathBuf>, config: &AppConfig) -> anyhow::Result<Vec<WorkbookReport>> {
    let handle = spawn_audit(launcher(config), paths, config.clone());
    let mut progress = ConsoleProgress::new("Audit");
    for event in handle.events().iter() {
        progress.handle(&event);
    }
    match handle.join() {
        Ok(reports) => Ok(reports),
        Err(Error::Cancelled { completed }) => {
            warn!("Audit cancelled; reporting {} completed file(s)", completed.len());
            Ok(completed)
        }
        Err(err) => Err(err).context("audit failed"),
    }
}

fn emit_reports(reports: &[WorkbookReport], format: OutputFormat, output: Option<&Path>) -> anyhow::Result<()> {
    let mut writer: Box<dyn Write> = match output {
        Some(path) => {
            colored::control::set_override(false);
            let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
            Box::new(BufWriter::new(file))
        }
        None => Box::new(io::stdout().lock()),
    };
    write_report(reports, format, &mut writer)?;
    writer.flush()?;
    if let Some(path) = output {
        info!("Report written to {}", path.display());
    }
    Ok(())
}

/// The report alone; progress and log lines go to stderr.
fn write_report<W: Write>(reports: &[WorkbookReport], format: OutputFormat, mut writer: W) -> anyhow::Result<()> {
    match format {
        OutputFormat::Table => write!(writer, "{}", report::render_table(reports))?,
        OutputFormat::Json => {
            report::write_json(reports, &mut writer)?;
            writeln!(writer)?;
        }
        OutputFormat::Csv => report::write_csv(reports, &mut writer)?,
    }
    Ok(())
}

fn run_repair(args: &RepairArgs, mut config: AppConfig) -> anyhow::Result<()> {
    config.engine.reset_before_batch |= args.reset;
    let paths = select_workbooks(&args.paths);
    if paths.is_empty() {
        return Ok(());
    }

    let jobs: Vec<RepairJob> = if args.from_audit {
        let reports = audit_batch(paths, &config)?;
        // The audit already reset the engine.
        config.engine.reset_before_batch = false;
        reports.iter().map(RepairJob::from_report).collect()
    } else {
        let plan = args.plan();
        if plan.is_empty() {
            bail!("no repair selected: pass --all, --from-audit or at least one repair flag");
        }
        paths
            .into_iter()
            .map(|path| RepairJob::new(path, plan.clone()))
            .collect()
    };

    if args.dry_run {
        for job in &jobs {
            let actions: Vec<String> = job.plan.actions().map(|a| a.to_string()).collect();
            if actions.is_empty() {
                println!("{}: nothing to repair", job.path.display());
            } else {
                println!("{}: {}", job.path.display(), actions.join(", "));
            }
        }
        return Ok(());
    }

    let outcomes = repair_batch(jobs, &config)?;
    print!("{}", report::render_repair_table(&outcomes));
    Ok(())
}

fn repair_batch(jobs: Vec<RepairJob>, config: &AppConfig) -> anyhow::Result<Vec<RepairOutcome>> {
    let handle = spawn_repair(launcher(config), jobs, config.clone());
    let mut progress = ConsoleProgress::new("Repair");
    for event in handle.events().iter() {
        progress.handle(&event);
    }
    match handle.join() {
        Ok(outcomes) => Ok(outcomes),
        Err(Error::RepairCancelled { completed }) => {
            warn!("Repair cancelled after {} file(s)", completed.len());
            Ok(completed)
        }
        Err(err) => Err(err).context("repair failed"),
    }
}

fn run_reset(config: &AppConfig) -> anyhow::Result<()> {
    let summary = launcher(config).reset()?;
    info!(
        "{} stale process(es) terminated, working set trimmed: {}",
        format!("{}", summary.processes_terminated).red(),
        summary.working_set_trimmed
    );
    Ok(())
}

fn print_config(config: &AppConfig) -> anyhow::Result<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use workbook_auditor::AuditTarget;

    fn missing_report() -> Vec<WorkbookReport> {
        let target = AuditTarget {
            path: PathBuf::from("gone.xlsx"),
            size_bytes: 0,
        };
        vec![WorkbookReport::critical(&target, "file not found".to_string())]
    }

    #[test]
    fn test_json_report_parses() {
        let mut buf = Vec::new();
        write_report(&missing_report(), OutputFormat::Json, &mut buf).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["reports"][0]["health"], "Critical");
        assert_eq!(value["reports"][0]["issues"][0]["kind"], "file_access");
    }

    #[test]
    fn test_csv_report_starts_with_headers() {
        let mut buf = Vec::new();
        write_report(&missing_report(), OutputFormat::Csv, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("file_name,path,size_mb,health,issue,reason,fix\n"));
        assert_eq!(text.lines().count(), 2);
    }
}
