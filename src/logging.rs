use std::env;
use std::ffi::OsString;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use tracing::{debug, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const DEFAULT_LOG_FILE: &str = "logs/workbook-auditor.log";

/// Logs to stderr and to `LOG_FILE_PATH`, filtered by `TRACING_LEVEL`.
/// Stdout is reserved for reports. Keep the returned guard alive for the
/// life of `main`.
pub fn init_logger() -> WorkerGuard {
    let filter = env::var("TRACING_LEVEL").unwrap_or_else(|_| "info".to_string());

    let log_file_path = env::var("LOG_FILE_PATH").unwrap_or_else(|_| DEFAULT_LOG_FILE.to_string());
    let (directory, file_name) = log_file_location(Path::new(&log_file_path));
    let file_appender = tracing_appender::rolling::never(directory, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(console_layer(io::stderr, io::stderr().is_terminal()))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(EnvFilter::new(filter))
        .init();

    debug!("Logging to stderr and {}", log_file_path);

    guard
}

fn console_layer<S, W>(writer: W, ansi: bool) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    fmt::layer()
        .compact()
        .without_time()
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(writer)
}

/// Splits a log path into the appender's directory and file name.
fn log_file_location(path: &Path) -> (PathBuf, OsString) {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| OsString::from("workbook-auditor.log"));
    (directory, file_name)
}
