//! Runs an audit or repair batch on one background thread.
//!
//! The worker forwards progress as [`BatchEvent`]s over an `mpsc` channel.
//! The calling thread drains [`BatchHandle::events`] until the channel
//! closes, then joins for the result.

use crate::auditor;
use crate::config::AppConfig;
use crate::engine::EngineLauncher;
use crate::error::Error;
use crate::model::{Health, WorkbookReport};
use crate::progress::ProgressReporter;
use crate::repair::{self, RepairJob, RepairOutcome, RepairStatus};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Shared cancellation flag, checked between files.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    Started { total: usize },
    FileStarted { index: usize, path: PathBuf },
    FileAudited { index: usize, health: Health },
    FileRepaired { index: usize, status: RepairStatus },
    Finished { files: usize, duration_secs: f64 },
}

/// Forwards every progress callback as a [`BatchEvent`].
pub struct ChannelReporter {
    sender: Mutex<mpsc::Sender<BatchEvent>>,
}

impl ChannelReporter {
    pub fn new(sender: mpsc::Sender<BatchEvent>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }

    fn send(&self, event: BatchEvent) {
        // A receiver that went away just stops listening.
        if let Ok(sender) = self.sender.lock() {
            let _ = sender.send(event);
        }
    }
}

impl ProgressReporter for ChannelReporter {
    fn on_batch_start(&self, total: usize) {
        self.send(BatchEvent::Started { total });
    }

    fn on_file_start(&self, index: usize, path: &Path) {
        self.send(BatchEvent::FileStarted {
            index,
            path: path.to_path_buf(),
        });
    }

    fn on_file_audited(&self, index: usize, health: Health) {
        self.send(BatchEvent::FileAudited { index, health });
    }

    fn on_file_repaired(&self, index: usize, status: RepairStatus) {
        self.send(BatchEvent::FileRepaired { index, status });
    }

    fn on_batch_complete(&self, files: usize, duration_secs: f64) {
        self.send(BatchEvent::Finished {
            files,
            duration_secs,
        });
    }
}

pub struct BatchHandle<T> {
    events: mpsc::Receiver<BatchEvent>,
    cancel: CancelToken,
    worker: JoinHandle<Result<T, Error>>,
}

impl<T> BatchHandle<T> {
    pub fn events(&self) -> &mpsc::Receiver<BatchEvent> {
        &self.events
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn join(self) -> Result<T, Error> {
        self.worker
            .join()
            .map_err(|_| Error::Other("batch worker panicked".to_string()))?
    }
}

fn spawn<T, F>(job: F) -> BatchHandle<T>
where
    T: Send + 'static,
    F: FnOnce(&ChannelReporter, &CancelToken) -> Result<T, Error> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let cancel = CancelToken::new();
    let worker_cancel = cancel.clone();
    let worker = thread::spawn(move || {
        let reporter = ChannelReporter::new(tx);
        job(&reporter, &worker_cancel)
    });
    BatchHandle {
        events: rx,
        cancel,
        worker,
    }
}

pub fn spawn_audit<L>(launcher: L, paths: Vec<PathBuf>, config: AppConfig) -> BatchHandle<Vec<WorkbookReport>>
where
    L: EngineLauncher + Send + 'static,
{
    spawn(move |reporter, cancel| auditor::audit(&launcher, &paths, &config, reporter, cancel))
}

pub fn spawn_repair<L>(launcher: L, jobs: Vec<RepairJob>, config: AppConfig) -> BatchHandle<Vec<RepairOutcome>>
where
    L: EngineLauncher + Send + 'static,
{
    spawn(move |reporter, cancel| repair::repair(&launcher, &jobs, &config, reporter, cancel))
}
