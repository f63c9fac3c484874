//! Shared domain types for the simulation job scheduler.
//!
//! This crate has no internal dependencies. It defines the job data model
//! ([`job_input::JobInput`], [`job_result::JobResult`] and its shared
//! [`job_result::JobHandle`]), the task lifecycle state machine, the
//! scheduler configuration and the common error type.

pub mod config;
pub mod error;
pub mod job_input;
pub mod job_result;
pub mod task_state;
pub mod types;

pub use error::CoreError;
