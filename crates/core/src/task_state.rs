//! Lifecycle state machine shared by execution and archive tasks.
//!
//! A task starts in [`TaskState::Created`], is admitted into a worker pool
//! ([`TaskState::Submitted`]) and ends in exactly one terminal state. Tasks
//! are not reusable once terminal.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle state of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Wrapped but not yet admitted into a worker pool.
    Created,
    /// Admitted into a worker pool and not yet terminal.
    Submitted,
    /// Ran to completion.
    Finished,
    /// Ended early after a cooperative stop request.
    Stopped,
    /// Ended with an error (validation, engine or archiving failure).
    Failed,
}

impl TaskState {
    /// `true` for `Finished`, `Stopped` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Stopped | Self::Failed)
    }

    /// `true` while the task occupies a worker pool slot.
    pub fn is_active(self) -> bool {
        self == Self::Submitted
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// `Created -> Failed` covers validation failures detected before the
    /// task was ever admitted.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Submitted)
                | (Self::Created, Self::Failed)
                | (Self::Submitted, Self::Finished)
                | (Self::Submitted, Self::Stopped)
                | (Self::Submitted, Self::Failed)
        )
    }

    /// Perform a checked transition, returning the new state.
    pub fn transition(self, next: TaskState) -> Result<TaskState, CoreError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Submitted => "submitted",
            Self::Finished => "finished",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
