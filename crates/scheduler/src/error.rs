use simrun_core::types::JobId;
use simrun_core::CoreError;

use crate::archive::ArchiveError;
use crate::engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The job cannot be run, e.g. its input definition is missing.
    #[error("Job {job_id} failed validation: {reason}")]
    Validation { job_id: JobId, reason: String },

    #[error("Engine execution failed: {0}")]
    EngineExecution(#[from] EngineError),

    #[error("Archiving failed: {0}")]
    Archiving(#[from] ArchiveError),

    /// Reorder or removal of a job whose task is already submitted.
    #[error("Rejected operation on job {job_id}: {reason}")]
    InvariantViolation { job_id: JobId, reason: String },

    #[error("Job {0} is not in the queue")]
    NotFound(JobId),

    #[error("Queue index {index} out of range (length {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Dispatcher is no longer running")]
    DispatcherClosed,

    #[error(transparent)]
    Core(#[from] CoreError),
}
