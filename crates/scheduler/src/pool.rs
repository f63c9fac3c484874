//! Bounded worker pool shared by the execution and archive dispatchers.
//!
//! The pool is only touched from its owning control loop, so it needs no
//! internal locking. The backing [`TaskTracker`] is created on the first
//! admission and closed again by [`WorkerPool::shutdown`] once no task is
//! active, mirroring the start / release cycle of a batch.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use simrun_core::task_state::TaskState;
use simrun_core::types::TaskId;
use simrun_core::CoreError;
use tokio_util::task::TaskTracker;

use crate::error::SchedulerError;

/// A unit of work that can be admitted into a [`WorkerPool`].
pub trait PoolTask: Send + Sync + 'static {
    fn id(&self) -> TaskId;

    fn state(&self) -> TaskState;

    /// Perform the `Created -> Submitted` transition.
    fn mark_submitted(&self) -> Result<(), CoreError>;

    /// The task body, driven to completion on a pool worker.
    fn execute(self: Arc<Self>) -> BoxFuture<'static, ()>;
}

pub struct WorkerPool<T: PoolTask> {
    name: &'static str,
    capacity: usize,
    active: HashMap<TaskId, Arc<T>>,
    tracker: Option<TaskTracker>,
}

impl<T: PoolTask> WorkerPool<T> {
    /// Create a pool admitting at most `capacity` tasks (minimum 1).
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            active: HashMap::new(),
            tracker: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active.len() < self.capacity
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// Whether a worker tracker is currently allocated.
    pub fn is_running(&self) -> bool {
        self.tracker.is_some()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.active.contains_key(&id)
    }

    pub fn active_tasks(&self) -> impl Iterator<Item = &Arc<T>> {
        self.active.values()
    }

    /// Mark `task` submitted and start it on a worker.
    ///
    /// Rejected when the pool is full or the task is not in `Created`.
    pub fn admit(&mut self, task: Arc<T>) -> Result<(), SchedulerError> {
        let id = task.id();
        if !self.has_capacity() {
            return Err(SchedulerError::InvariantViolation {
                job_id: id,
                reason: format!("{} pool is full ({} active)", self.name, self.active.len()),
            });
        }
        task.mark_submitted()?;

        let tracker = self.tracker.get_or_insert_with(TaskTracker::new);
        tracker.spawn(Arc::clone(&task).execute());
        self.active.insert(id, task);

        tracing::debug!(
            pool = self.name,
            task_id = %id,
            active = self.active.len(),
            capacity = self.capacity,
            "Task admitted",
        );
        Ok(())
    }

    /// Free the slot held by `id`.
    pub fn release(&mut self, id: TaskId) -> Option<Arc<T>> {
        self.active.remove(&id)
    }

    /// Close the tracker so it accepts no more work and hand it back.
    ///
    /// The caller may await [`TaskTracker::wait`] on the returned tracker
    /// to join the tail of the last task bodies.
    pub fn shutdown(&mut self) -> Option<TaskTracker> {
        let tracker = self.tracker.take()?;
        tracker.close();
        tracing::debug!(pool = self.name, "Worker pool released");
        Some(tracker)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
