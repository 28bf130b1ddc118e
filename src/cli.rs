use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use workbook_auditor::{RepairAction, RepairPlan};

#[derive(Debug, Parser)]
#[command(name = "workbook-auditor")]
#[command(about = "Audit spreadsheet workbooks for performance problems and repair them", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Audit workbooks and report their health
    Audit(AuditArgs),
    /// Apply repairs to workbooks
    Repair(RepairArgs),
    /// Terminate stale spreadsheet processes and trim memory
    Reset,
    /// Print configuration values
    PrintConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

#[derive(Debug, Args)]
pub struct AuditArgs {
    /// Workbook files, directories or glob patterns
    #[arg(required = true)]
    pub paths: Vec<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    pub format: OutputFormat,

    /// Write the report to a file instead of stdout
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Reset the spreadsheet engine before the batch
    #[arg(long)]
    pub reset: bool,
}

#[derive(Debug, Args)]
pub struct RepairArgs {
    /// Workbook files, directories or glob patterns
    #[arg(required = true)]
    pub paths: Vec<String>,

    /// Delete the rows below the last data row of every sheet
    #[arg(long)]
    pub purge_ghost_rows: bool,

    /// Force a full recalculation and rebuild the calculation chain
    #[arg(long)]
    pub rebuild_calc_chain: bool,

    /// Save a copy in the engine's compact format
    #[arg(long)]
    pub convert: bool,

    /// Apply every repair
    #[arg(long)]
    pub all: bool,

    /// Audit first and apply the repairs each workbook's issues call for
    #[arg(long, conflicts_with_all = ["purge_ghost_rows", "rebuild_calc_chain", "convert", "all"])]
    pub from_audit: bool,

    /// List the planned repairs without touching any file
    #[arg(long)]
    pub dry_run: bool,

    /// Reset the spreadsheet engine before the batch
    #[arg(long)]
    pub reset: bool,
}

impl RepairArgs {
    /// The plan selected by flags; empty when `--from-audit` decides.
    pub fn plan(&self) -> RepairPlan {
        if self.all {
            return RepairPlan::all();
        }
        let selected = [
            (self.purge_ghost_rows, RepairAction::PurgeGhostRows),
            (self.rebuild_calc_chain, RepairAction::RebuildCalculationChain),
            (self.convert, RepairAction::ConvertToBinary),
        ];
        RepairPlan::new(
            selected
                .into_iter()
                .filter_map(|(on, action)| on.then_some(action)),
        )
    }
}
