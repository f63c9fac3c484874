//! Admission control and lifecycle management for simulation jobs.
//!
//! The execution side is driven by [`dispatcher::Dispatcher`]: a handle to a
//! single control loop that owns the [`queue::ExecutionQueue`] and admits
//! wrapped [`execution_task::ExecutionTask`]s into a bounded
//! [`pool::WorkerPool`]. Numeric work is delegated to an injected
//! [`engine::SimulationEngine`].
//!
//! Archiving runs independently through [`archive_dispatcher::ArchiveDispatcher`],
//! a strictly serial FIFO pipeline of [`archive::ArchiveTask`]s.

pub mod archive;
pub mod archive_dispatcher;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod execution_task;
pub mod pool;
pub mod process_engine;
pub mod queue;
pub mod registry;

pub use dispatcher::{Dispatcher, DispatcherStatus};
pub use error::SchedulerError;
