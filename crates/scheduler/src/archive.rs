//! Directory-to-zip archiving unit.
//!
//! An [`ArchiveTask`] compresses one directory tree into a single zip file.
//! Entry names are relative to the parent of the source directory, so the
//! archive contains the source directory as its top-level folder. Files
//! whose name fully matches the exclusion pattern are skipped.
//!
//! [`ArchiveTask::run`] is blocking and may be called directly by an
//! interactive caller; [`ArchiveTask::run_async`] moves it onto the
//! blocking thread pool. Archiving cannot be cancelled.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use regex::Regex;
use serde::Serialize;
use simrun_core::task_state::TaskState;
use simrun_core::types::{new_id, TaskId};
use simrun_core::CoreError;
use simrun_events::{FailureKind, Notifier, SubscriptionId, TaskEvent, TaskFailure, TaskKind, TaskNotification};
use tokio::sync::{mpsc, watch};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::pool::PoolTask;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("Archive source is not a directory: {0}")]
    SourceNotDirectory(PathBuf),

    #[error("Archive destination already exists: {0}")]
    DestinationExists(PathBuf),

    #[error("Invalid exclusion pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// The task was already run once.
    #[error("Archive task cannot run from state {0}")]
    InvalidState(TaskState),

    #[error("Archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Failure reported by a task that ran on the archive pool.
    #[error("{0}")]
    Reported(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

/// Parameters of one archive run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRequest {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub exclusion_pattern: Option<String>,
    /// Store entries instead of deflating them.
    pub uncompressed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Files written into the archive.
    pub entries: usize,
    /// Files skipped by the exclusion pattern.
    pub excluded: usize,
}

#[derive(Debug)]
pub struct ArchiveTask {
    id: TaskId,
    source: PathBuf,
    destination: PathBuf,
    exclusion: Option<Regex>,
    uncompressed: bool,
    notifier: Notifier,
    state: watch::Sender<TaskState>,
    outcome: Mutex<Option<Result<ArchiveSummary, String>>>,
}

impl ArchiveTask {
    /// Validate `request` and build a task in `Created`.
    pub fn new(request: &ArchiveRequest) -> Result<Self, ArchiveError> {
        if !request.source.is_dir() {
            return Err(ArchiveError::SourceNotDirectory(request.source.clone()));
        }
        if request.destination.exists() {
            return Err(ArchiveError::DestinationExists(request.destination.clone()));
        }
        let exclusion = request
            .exclusion_pattern
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| Regex::new(&format!("^(?:{p})$")))
            .transpose()?;

        let id = new_id();
        let (state, _) = watch::channel(TaskState::Created);
        Ok(Self {
            id,
            source: request.source.clone(),
            destination: request.destination.clone(),
            exclusion,
            uncompressed: request.uncompressed,
            notifier: Notifier::new(id, TaskKind::Archive),
            state,
            outcome: Mutex::new(None),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<TaskState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self, sender: mpsc::UnboundedSender<TaskNotification>) -> SubscriptionId {
        self.notifier.subscribe(sender)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }

    pub fn mark_submitted(&self) -> Result<(), CoreError> {
        self.transition(TaskState::Submitted)
    }

    /// Result of a finished run, `None` while not terminal.
    pub fn outcome(&self) -> Option<Result<ArchiveSummary, ArchiveError>> {
        self.outcome
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .map(|r| r.map_err(ArchiveError::Reported))
    }

    /// Write the archive, blocking the calling thread.
    pub fn run(&self) -> Result<ArchiveSummary, ArchiveError> {
        match self.state() {
            TaskState::Created => self.mark_submitted()?,
            TaskState::Submitted => {}
            other => return Err(ArchiveError::InvalidState(other)),
        }

        tracing::info!(
            task_id = %self.id,
            source = %self.source.display(),
            destination = %self.destination.display(),
            uncompressed = self.uncompressed,
            "Archiving started",
        );
        self.notifier.emit(TaskEvent::Progress(0));

        let mut created = false;
        let result = self.write_archive(&mut created);
        match &result {
            Ok(summary) => {
                self.store_outcome(Ok(summary.clone()));
                self.set_terminal(TaskState::Finished);
                tracing::info!(
                    task_id = %self.id,
                    entries = summary.entries,
                    excluded = summary.excluded,
                    "Archiving finished",
                );
                self.notifier.emit(TaskEvent::Progress(TaskEvent::COMPLETE));
            }
            Err(e) => {
                if created {
                    if let Err(remove_err) = std::fs::remove_file(&self.destination) {
                        tracing::warn!(
                            task_id = %self.id,
                            error = %remove_err,
                            "Failed to delete partial archive",
                        );
                    }
                }
                self.store_outcome(Err(e.to_string()));
                self.set_terminal(TaskState::Failed);
                tracing::error!(task_id = %self.id, error = %e, "Archiving failed");
                self.notifier
                    .emit(TaskEvent::Error(TaskFailure::new(FailureKind::Archiving, e.to_string())));
            }
        }
        result
    }

    /// Run on the blocking thread pool.
    ///
    /// A panicking worker still leaves the task `Failed` with an error
    /// notification.
    pub async fn run_async(self: Arc<Self>) -> Result<ArchiveSummary, ArchiveError> {
        let task = Arc::clone(&self);
        match tokio::task::spawn_blocking(move || task.run()).await {
            Ok(result) => result,
            Err(e) => {
                let reason = format!("Archive worker aborted: {e}");
                self.abort(&reason);
                Err(ArchiveError::Reported(reason))
            }
        }
    }

    /// Fail a task whose run ended without reaching a terminal state.
    fn abort(&self, reason: &str) {
        if self.state().is_terminal() {
            return;
        }
        self.store_outcome(Err(reason.to_string()));
        self.set_terminal(TaskState::Failed);
        tracing::error!(task_id = %self.id, error = reason, "Archiving aborted");
        self.notifier
            .emit(TaskEvent::Error(TaskFailure::new(FailureKind::Archiving, reason)));
    }

    // ---- private helpers ----

    fn write_archive(&self, created: &mut bool) -> Result<ArchiveSummary, ArchiveError> {
        let mut listing = Listing::default();
        self.collect(&self.source, &mut listing)?;
        let total = listing.files.len();

        if let Some(parent) = self.destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.destination)?;
        *created = true;
        let mut zip = ZipWriter::new(BufWriter::new(file));

        let method = if self.uncompressed {
            CompressionMethod::Stored
        } else {
            CompressionMethod::Deflated
        };
        let options = SimpleFileOptions::default()
            .compression_method(method)
            .large_file(true);

        let base = self.source.parent().unwrap_or(&self.source);
        for dir in &listing.directories {
            zip.add_directory(entry_name(base, dir), options)?;
        }

        let mut last_percent = 0;
        for (done, path) in listing.files.iter().enumerate() {
            zip.start_file(entry_name(base, path), options)?;
            let mut input = File::open(path)?;
            std::io::copy(&mut input, &mut zip)?;

            let percent = capped_percent(done + 1, total);
            if percent != last_percent {
                last_percent = percent;
                self.notifier.emit(TaskEvent::Progress(percent));
            }
        }

        let mut writer = zip.finish()?;
        writer.flush()?;

        Ok(ArchiveSummary {
            source: self.source.clone(),
            destination: self.destination.clone(),
            entries: total,
            excluded: listing.excluded,
        })
    }

    fn collect(&self, dir: &Path, listing: &mut Listing) -> std::io::Result<()> {
        listing.directories.push(dir.to_path_buf());
        let mut entries = std::fs::read_dir(dir)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort();

        for path in entries {
            if path.is_dir() {
                self.collect(&path, listing)?;
            } else if path == self.destination {
                continue;
            } else if self.is_excluded(&path) {
                listing.excluded += 1;
            } else {
                listing.files.push(path);
            }
        }
        Ok(())
    }

    fn is_excluded(&self, path: &Path) -> bool {
        let Some(pattern) = &self.exclusion else {
            return false;
        };
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| pattern.is_match(name))
    }

    fn store_outcome(&self, outcome: Result<ArchiveSummary, String>) {
        *self.outcome.lock().unwrap_or_else(|e| e.into_inner()) = Some(outcome);
    }

    fn set_terminal(&self, next: TaskState) {
        if let Err(e) = self.transition(next) {
            tracing::error!(task_id = %self.id, error = %e, "Archive state out of sync");
        }
    }

    fn transition(&self, next: TaskState) -> Result<(), CoreError> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| match state.transition(next) {
            Ok(new_state) => {
                *state = new_state;
                true
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });
        outcome
    }
}

impl PoolTask for ArchiveTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn state(&self) -> TaskState {
        ArchiveTask::state(self)
    }

    fn mark_submitted(&self) -> Result<(), CoreError> {
        ArchiveTask::mark_submitted(self)
    }

    fn execute(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if let Err(e) = self.run_async().await {
                tracing::debug!(error = %e, "Background archive ended with error");
            }
        })
    }
}

#[derive(Default)]
struct Listing {
    directories: Vec<PathBuf>,
    files: Vec<PathBuf>,
    excluded: usize,
}

/// Zip entry name of `path` relative to `base`, with `/` separators.
fn entry_name(base: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// `round(done / total * 100)`, capped at 99 until the archive is closed.
fn capped_percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = (done as f64 / total as f64 * 100.0).round();
    percent.min(99.0) as u8
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
