use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use workbook_auditor::{BatchEvent, Health, RepairStatus};

/// Renders batch events drained from the worker channel as an indicatif
/// progress bar.
pub struct ConsoleProgress {
    verb: &'static str,
    bar: Option<ProgressBar>,
    current: String,
}

impl ConsoleProgress {
    pub fn new(verb: &'static str) -> Self {
        Self {
            verb,
            bar: None,
            current: String::new(),
        }
    }

    pub fn handle(&mut self, event: &BatchEvent) {
        match event {
            BatchEvent::Started { total } => {
                let pb = ProgressBar::new(*total as u64);
                let style = ProgressStyle::with_template(
                    "  {spinner:.cyan} {prefix} [{bar:30.cyan/dim}] {pos}/{len} files {msg}",
                )
                .map(|s| s.progress_chars("━╸─").tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"))
                .unwrap_or_else(|_| ProgressStyle::default_bar());
                pb.set_style(style);
                pb.set_prefix(self.verb);
                pb.enable_steady_tick(Duration::from_millis(80));
                self.bar = Some(pb);
            }
            BatchEvent::FileStarted { path, .. } => {
                self.current = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if let Some(pb) = &self.bar {
                    pb.set_message(self.current.clone());
                }
            }
            BatchEvent::FileAudited { health, .. } => {
                if *health == Health::Critical {
                    self.note(&format!("{} could not be opened", self.current));
                }
                self.advance();
            }
            BatchEvent::FileRepaired { status, .. } => {
                if *status != RepairStatus::Repaired {
                    self.note(&format!("{}: {}", self.current, status));
                }
                self.advance();
            }
            BatchEvent::Finished {
                files,
                duration_secs,
            } => {
                if let Some(pb) = self.bar.take() {
                    pb.finish_and_clear();
                }
                eprintln!(
                    "  \x1b[32m✓\x1b[0m {} complete: {} files in {:.2}s",
                    self.verb, files, duration_secs
                );
            }
        }
    }

    fn note(&self, message: &str) {
        match &self.bar {
            Some(pb) => pb.println(format!("  ! {}", message)),
            None => eprintln!("  ! {}", message),
        }
    }

    fn advance(&self) {
        if let Some(pb) = &self.bar {
            pb.inc(1);
        }
    }
}
