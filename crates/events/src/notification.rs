//! Events emitted by a single task to its subscribers.
//!
//! `Progress(100)` is the terminal success signal (also sent by stopped
//! runs); `Error` is the terminal failure signal. Subscribers unsubscribe
//! on either.

use serde::{Deserialize, Serialize};
use simrun_core::types::{TaskId, Timestamp};

/// Which kind of task produced a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Execution,
    Archive,
}

/// Classification of an asynchronous failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The job could not be started (e.g. missing input definition).
    Validation,
    /// The simulation engine failed mid-run.
    EngineExecution,
    /// Writing the archive failed.
    Archiving,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Heartbeat of a running task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Liveness {
    /// Latest progress reported by the engine, if any.
    pub percent: Option<u8>,
    /// Free-form remaining time estimate.
    pub remaining: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TaskEvent {
    Progress(u8),
    Error(TaskFailure),
    Liveness(Liveness),
}

impl TaskEvent {
    /// Progress value that ends a task.
    pub const COMPLETE: u8 = 100;

    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Progress(percent) => *percent >= Self::COMPLETE,
            Self::Error(_) => true,
            Self::Liveness(_) => false,
        }
    }
}

/// A [`TaskEvent`] tagged with its origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNotification {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub event: TaskEvent,
    pub emitted_at: Timestamp,
}

impl TaskNotification {
    pub fn new(task_id: TaskId, kind: TaskKind, event: TaskEvent) -> Self {
        Self {
            task_id,
            kind,
            event,
            emitted_at: chrono::Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.event.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
