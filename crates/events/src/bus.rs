//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] carries scheduler-level [`SchedulerEvent`]s (admissions,
//! completions, pool releases, archive runs) to any number of observers.
//! It is shared via `Arc<EventBus>`; publishing never blocks and events are
//! dropped when nobody listens.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use simrun_core::job_result::ProcessingStatus;
use simrun_core::types::{JobId, TaskId, Timestamp};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// SchedulerEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    JobQueued {
        job_id: JobId,
        position: usize,
    },
    JobAdmitted {
        job_id: JobId,
        active: usize,
        limit: usize,
    },
    JobProgress {
        job_id: JobId,
        percent: u8,
    },
    JobCompleted {
        job_id: JobId,
        status: ProcessingStatus,
    },
    JobFailed {
        job_id: JobId,
        message: String,
    },
    /// The execution worker pool went idle and was released.
    PoolReleased,
    ArchiveStarted {
        task_id: TaskId,
        source: PathBuf,
    },
    ArchiveCompleted {
        task_id: TaskId,
        destination: PathBuf,
        entries: usize,
    },
    ArchiveFailed {
        task_id: TaskId,
        message: String,
    },
}

impl SchedulerEvent {
    /// Dot-separated name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobQueued { .. } => "job.queued",
            Self::JobAdmitted { .. } => "job.admitted",
            Self::JobProgress { .. } => "job.progress",
            Self::JobCompleted { .. } => "job.completed",
            Self::JobFailed { .. } => "job.failed",
            Self::PoolReleased => "pool.released",
            Self::ArchiveStarted { .. } => "archive.started",
            Self::ArchiveCompleted { .. } => "archive.completed",
            Self::ArchiveFailed { .. } => "archive.failed",
        }
    }
}

/// A [`SchedulerEvent`] with the time it was published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub event: SchedulerEvent,
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

pub struct EventBus {
    sender: broadcast::Sender<BusMessage>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full the oldest messages are dropped and slow
    /// receivers observe `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: SchedulerEvent) {
        // A SendError only means there are no receivers.
        let _ = self.sender.send(BusMessage {
            timestamp: chrono::Utc::now(),
            event,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
