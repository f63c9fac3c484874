//! Ordered list of pending jobs.
//!
//! The queue is owned by the dispatcher's control loop; it is plain data
//! with no locking of its own. An entry is wrapped into an
//! [`ExecutionTask`] when a batch starts. Entries whose task is submitted
//! are pinned: they can no longer be moved or removed.

use std::sync::Arc;

use serde::Serialize;
use simrun_core::job_result::{JobHandle, ProcessingStatus};
use simrun_core::task_state::TaskState;
use simrun_core::types::JobId;

use crate::error::SchedulerError;
use crate::execution_task::ExecutionTask;

pub struct QueueEntry {
    job: JobHandle,
    task: Option<Arc<ExecutionTask>>,
}

impl QueueEntry {
    pub fn job(&self) -> &JobHandle {
        &self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id()
    }

    pub fn task(&self) -> Option<&Arc<ExecutionTask>> {
        self.task.as_ref()
    }

    pub fn task_state(&self) -> Option<TaskState> {
        self.task.as_ref().map(|t| t.state())
    }

    /// Submitted and not yet terminal.
    pub fn is_submitted(&self) -> bool {
        self.task_state().is_some_and(TaskState::is_active)
    }

    /// Needs a fresh task before it can be admitted.
    pub fn needs_task(&self) -> bool {
        self.task_state().map_or(true, TaskState::is_terminal)
    }
}

/// Read-only view of one queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueEntrySnapshot {
    pub job_id: JobId,
    pub description: String,
    pub status: ProcessingStatus,
    /// `None` until the entry was wrapped by a batch start.
    pub task_state: Option<TaskState>,
}

#[derive(Default)]
pub struct ExecutionQueue {
    entries: Vec<QueueEntry>,
}

impl ExecutionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[QueueEntry] {
        &self.entries
    }

    /// Append `job` and return its position.
    pub fn enqueue(&mut self, job: JobHandle) -> usize {
        self.entries.push(QueueEntry { job, task: None });
        self.entries.len() - 1
    }

    pub fn position(&self, job_id: JobId) -> Option<usize> {
        self.entries.iter().position(|e| e.job_id() == job_id)
    }

    /// Swap the entry at `index` with its predecessor.
    pub fn move_up(&mut self, index: usize) -> Result<(), SchedulerError> {
        self.check_movable(index)?;
        if index == 0 {
            return Ok(());
        }
        self.check_movable(index - 1)?;
        self.entries.swap(index, index - 1);
        Ok(())
    }

    /// Swap the entry at `index` with its successor.
    pub fn move_down(&mut self, index: usize) -> Result<(), SchedulerError> {
        self.check_movable(index)?;
        if index + 1 >= self.entries.len() {
            return Ok(());
        }
        self.check_movable(index + 1)?;
        self.entries.swap(index, index + 1);
        Ok(())
    }

    /// Remove a job that is not submitted and reset its restart flags.
    pub fn remove_pending(&mut self, job_id: JobId) -> Result<JobHandle, SchedulerError> {
        let index = self
            .position(job_id)
            .ok_or(SchedulerError::NotFound(job_id))?;
        if self.entries[index].is_submitted() {
            return Err(SchedulerError::InvariantViolation {
                job_id,
                reason: "task is submitted; stop it first".to_string(),
            });
        }
        let entry = self.entries.remove(index);
        entry.job.write().clear_restart();
        Ok(entry.job)
    }

    /// Drop the entry of a task that reached a terminal state.
    pub(crate) fn remove_finished(&mut self, job_id: JobId) -> Option<QueueEntry> {
        let index = self.position(job_id)?;
        Some(self.entries.remove(index))
    }

    pub(crate) fn attach_task(&mut self, index: usize, task: Arc<ExecutionTask>) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.task = Some(task);
        }
    }

    /// The first wrapped task still waiting for admission.
    pub fn next_admissible(&self) -> Option<Arc<ExecutionTask>> {
        self.entries
            .iter()
            .filter_map(|e| e.task.as_ref())
            .find(|t| t.state() == TaskState::Created)
            .cloned()
    }

    pub fn waiting_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.task_state() != Some(TaskState::Submitted))
            .count()
    }

    pub fn snapshot(&self) -> Vec<QueueEntrySnapshot> {
        self.entries
            .iter()
            .map(|e| {
                let job = e.job.read();
                QueueEntrySnapshot {
                    job_id: job.id,
                    description: job.description.clone(),
                    status: job.status,
                    task_state: e.task_state(),
                }
            })
            .collect()
    }

    fn check_movable(&self, index: usize) -> Result<(), SchedulerError> {
        let entry = self
            .entries
            .get(index)
            .ok_or(SchedulerError::IndexOutOfRange {
                index,
                len: self.entries.len(),
            })?;
        if entry.is_submitted() {
            return Err(SchedulerError::InvariantViolation {
                job_id: entry.job_id(),
                reason: "task is submitted and cannot be reordered".to_string(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
