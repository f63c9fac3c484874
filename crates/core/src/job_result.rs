//! Mutable record of one simulation run.
//!
//! A [`JobResult`] is created fresh from a [`JobInput`] or by cloning a
//! finished result for a restart ([`JobResult::clone_for_restart`]). The
//! queue, the execution task and any viewer share it through a
//! [`JobHandle`].
//!
//! The output directory is protected by a reentrant view lock: every
//! [`JobHandle::begin_view`] increments a counter, dropping the returned
//! [`ViewGuard`] decrements it, and [`JobHandle::delete_output`] refuses to
//! run while the counter is non-zero.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::job_input::{JobInput, APPLICATION_VERSION};
use crate::types::{new_id, JobId, Timestamp};

/// File name of the result snapshot written into the output directory.
pub const JOB_RESULT_FILE_NAME: &str = "job_result.json";

// ---------------------------------------------------------------------------
// Processing status
// ---------------------------------------------------------------------------

/// Outcome of the most recent run of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    NotStarted,
    Running,
    FinishedWithSuccess,
    FinishedWithFailure,
    Stopped,
}

impl ProcessingStatus {
    /// `true` once a run has ended, whatever the outcome.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::FinishedWithSuccess | Self::FinishedWithFailure | Self::Stopped
        )
    }
}

/// Latest liveness information reported by a running engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliveInfo {
    pub percent: Option<u8>,
    /// Engine estimate of the remaining time, free text.
    pub remaining: Option<String>,
    pub updated_at: Timestamp,
}

// ---------------------------------------------------------------------------
// JobResult
// ---------------------------------------------------------------------------

/// Execution record of one simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub id: JobId,
    pub description: String,
    /// Resolved input; absent for a queued job that has not been loaded.
    pub input: Option<JobInput>,
    /// Path of the stored input definition.
    pub input_path: Option<PathBuf>,
    pub status: ProcessingStatus,
    /// Directory the engine writes into.
    pub output_path: Option<PathBuf>,
    /// Application version that produced this result.
    pub version: String,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
    is_stopped: bool,
    to_be_restarted: bool,
    restarted: bool,
    additional_steps_for_restart: u64,
    /// Output directory of the run this result restarts from.
    restart_source: Option<PathBuf>,
    #[serde(skip)]
    alive: Option<AliveInfo>,
    #[serde(skip)]
    view_locks: usize,
}

impl JobResult {
    /// Create a fresh result for a loaded input.
    ///
    /// The first run of an input shares its id, so the registry can resolve
    /// the stored input from a [`JobHandle::id`]. Restart clones get their
    /// own id.
    pub fn from_input(input: JobInput) -> Self {
        let mut result = Self::pending(input.description.clone(), input.path.clone());
        result.id = input.id;
        result.input = Some(input);
        result
    }

    /// Create a fresh result that only knows where its input is stored.
    pub fn pending(description: impl Into<String>, input_path: impl Into<PathBuf>) -> Self {
        Self {
            id: new_id(),
            description: description.into(),
            input: None,
            input_path: Some(input_path.into()),
            status: ProcessingStatus::NotStarted,
            output_path: None,
            version: APPLICATION_VERSION.to_string(),
            started_at: None,
            finished_at: None,
            is_stopped: false,
            to_be_restarted: false,
            restarted: false,
            additional_steps_for_restart: 0,
            restart_source: None,
            alive: None,
            view_locks: 0,
        }
    }

    /// Path of the input definition, preferring the loaded input.
    pub fn resolved_input_path(&self) -> Option<&Path> {
        self.input
            .as_ref()
            .map(|input| input.path.as_path())
            .or(self.input_path.as_deref())
    }

    /// Whether the input definition can be resolved to an existing directory.
    pub fn has_valid_input_path(&self) -> bool {
        self.resolved_input_path().is_some_and(Path::is_dir)
    }

    // ---- restart ----

    /// Clone a finished result so it can be re-run with additional steps.
    ///
    /// The clone gets a new identity and no view locks. Its flags are
    /// independent of `self`; the previous output directory becomes the
    /// restart source that is copied before the engine starts.
    pub fn clone_for_restart(&self, additional_steps: u64) -> Result<JobResult, CoreError> {
        if !self.status.is_terminal() {
            return Err(CoreError::Conflict(format!(
                "Job {} has not finished and cannot be restarted",
                self.id
            )));
        }
        let source = self
            .output_path
            .as_ref()
            .filter(|path| path.is_dir())
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "Job {} has no output directory to restart from",
                    self.id
                ))
            })?;

        let mut clone = self.clone();
        clone.id = new_id();
        clone.status = ProcessingStatus::NotStarted;
        clone.started_at = None;
        clone.finished_at = None;
        clone.is_stopped = false;
        clone.alive = None;
        clone.view_locks = 0;
        clone.restart_source = Some(source.clone());
        clone.output_path = None;
        clone.restarted = false;
        clone.set_to_be_restarted(additional_steps);
        Ok(clone)
    }

    /// Flag this result for a restart run.
    pub fn set_to_be_restarted(&mut self, additional_steps: u64) {
        self.to_be_restarted = true;
        self.restarted = false;
        self.additional_steps_for_restart = additional_steps;
    }

    /// Reset every restart flag, e.g. when the job leaves the queue.
    pub fn clear_restart(&mut self) {
        self.to_be_restarted = false;
        self.additional_steps_for_restart = 0;
    }

    /// Turn a pending restart into an actual one.
    ///
    /// Returns the directory to copy from, or `None` when this result was
    /// not flagged for restart.
    pub fn mark_restarted(&mut self) -> Option<PathBuf> {
        if !self.to_be_restarted {
            return None;
        }
        self.to_be_restarted = false;
        self.restarted = true;
        self.description = format!(
            "{} (restart +{} steps)",
            self.description, self.additional_steps_for_restart
        );
        self.restart_source.clone()
    }

    pub fn is_to_be_restarted(&self) -> bool {
        self.to_be_restarted
    }

    pub fn is_restarted(&self) -> bool {
        self.restarted
    }

    pub fn additional_steps_for_restart(&self) -> u64 {
        self.additional_steps_for_restart
    }

    pub fn restart_source(&self) -> Option<&Path> {
        self.restart_source.as_deref()
    }

    // ---- run lifecycle ----

    /// Record the start of a run writing into `output_path`.
    pub fn mark_running(&mut self, output_path: PathBuf, at: Timestamp) {
        self.status = ProcessingStatus::Running;
        self.output_path = Some(output_path);
        self.started_at = Some(at);
        self.finished_at = None;
        self.is_stopped = false;
    }

    /// Record that a stop was honoured.
    pub fn mark_stopped(&mut self) {
        self.is_stopped = true;
        self.alive = None;
    }

    pub fn is_stopped(&self) -> bool {
        self.is_stopped
    }

    /// Record the end of a run.
    pub fn finish(&mut self, status: ProcessingStatus, at: Timestamp) {
        self.status = status;
        self.finished_at = Some(at);
        self.alive = None;
    }

    pub fn set_alive(&mut self, percent: Option<u8>, remaining: Option<String>) {
        self.alive = Some(AliveInfo {
            percent,
            remaining,
            updated_at: chrono::Utc::now(),
        });
    }

    pub fn alive(&self) -> Option<&AliveInfo> {
        self.alive.as_ref()
    }

    /// Write a JSON snapshot of this record into the output directory.
    pub fn write_snapshot(&self) -> Result<(), CoreError> {
        let Some(dir) = self.output_path.as_ref().filter(|p| p.is_dir()) else {
            return Err(CoreError::NotFound {
                entity: "output directory",
                id: self.id,
            });
        };
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| CoreError::Internal(format!("Failed to serialize job result: {e}")))?;
        std::fs::write(dir.join(JOB_RESULT_FILE_NAME), json)?;
        Ok(())
    }

    // ---- view lock ----

    pub fn begin_view(&mut self) {
        self.view_locks += 1;
    }

    /// Decrement the view count; extra calls are ignored.
    pub fn end_view(&mut self) {
        self.view_locks = self.view_locks.saturating_sub(1);
    }

    pub fn view_lock_count(&self) -> usize {
        self.view_locks
    }

    pub fn is_output_locked(&self) -> bool {
        self.view_locks > 0
    }
}

// ---------------------------------------------------------------------------
// JobHandle
// ---------------------------------------------------------------------------

/// Shared, cloneable reference to a [`JobResult`].
///
/// Locks are held only for short field updates; poisoning is recovered
/// since every update leaves the record consistent.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    inner: Arc<RwLock<JobResult>>,
}

impl JobHandle {
    pub fn new(result: JobResult) -> Self {
        Self {
            id: result.id,
            inner: Arc::new(RwLock::new(result)),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, JobResult> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, JobResult> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Owned copy of the current record.
    pub fn snapshot(&self) -> JobResult {
        self.read().clone()
    }

    /// Start inspecting the output directory.
    ///
    /// The output cannot be deleted until the returned guard is dropped.
    pub fn begin_view(&self) -> ViewGuard {
        self.write().begin_view();
        ViewGuard {
            handle: self.clone(),
        }
    }

    /// Delete the output directory if nobody is viewing it.
    ///
    /// The write lock is held for the whole deletion so no view can begin
    /// half way through. Returns the deleted path.
    pub fn delete_output(&self) -> Result<PathBuf, CoreError> {
        let mut result = self.write();
        if result.is_output_locked() {
            return Err(CoreError::Conflict(format!(
                "Output of job {} is being viewed ({} active views)",
                self.id,
                result.view_lock_count()
            )));
        }
        let path = result.output_path.take().ok_or(CoreError::NotFound {
            entity: "output directory",
            id: self.id,
        })?;
        if path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&path) {
                result.output_path = Some(path);
                return Err(e.into());
            }
        }
        Ok(path)
    }
}

/// Ends a view of a job's output directory when dropped.
#[derive(Debug)]
pub struct ViewGuard {
    handle: JobHandle,
}

impl Drop for ViewGuard {
    fn drop(&mut self) {
        self.handle.write().end_view();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
