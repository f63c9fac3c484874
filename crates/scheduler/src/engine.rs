//! Simulation engine interface.
//!
//! The scheduler never performs numeric work itself. It hands an
//! [`EngineRequest`] to an injected [`SimulationEngine`] together with an
//! [`EngineContext`] carrying the cooperative stop token and a progress
//! channel. Engines are expected to poll [`EngineContext::is_stop_requested`]
//! between discrete simulation steps.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use simrun_core::types::JobId;
use simrun_events::Liveness;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Everything an engine needs to run one job.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub job_id: JobId,
    /// Directory holding the stored job input.
    pub input_path: PathBuf,
    /// Directory receiving step-indexed output files.
    pub output_path: PathBuf,
    /// Opaque parameter set taken from the job input.
    pub parameters: serde_json::Value,
    /// Extra steps for a restarted run, `None` for a fresh run.
    pub additional_steps: Option<u64>,
}

/// Stop signal and progress sink handed to a running engine.
#[derive(Debug, Clone)]
pub struct EngineContext {
    cancel: CancellationToken,
    progress: Arc<watch::Sender<Liveness>>,
}

impl EngineContext {
    pub fn new(cancel: CancellationToken, progress: watch::Sender<Liveness>) -> Self {
        Self {
            cancel,
            progress: Arc::new(progress),
        }
    }

    /// Whether the task was asked to stop. Checked between steps.
    pub fn is_stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once a stop was requested.
    pub async fn stop_requested(&self) {
        self.cancel.cancelled().await
    }

    /// Publish the latest progress estimate.
    pub fn report(&self, percent: u8, remaining: Option<String>) {
        self.progress.send_replace(Liveness {
            percent: Some(percent.min(100)),
            remaining,
        });
    }
}

/// How an engine run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOutcome {
    /// Ran all requested steps.
    Completed,
    /// Ended early because a stop was requested.
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine process could not be started.
    #[error("Failed to start engine: {0}")]
    Spawn(#[source] std::io::Error),

    /// The engine ended with a failure exit status.
    #[error("Engine exited with code {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },

    #[error("Engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other engine-reported failure.
    #[error("{0}")]
    Failed(String),
}

/// An external simulation engine treated as a black box.
#[async_trait]
pub trait SimulationEngine: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Run the simulation described by `request` to completion or until a
    /// stop is requested through `ctx`.
    async fn run(
        &self,
        request: EngineRequest,
        ctx: EngineContext,
    ) -> Result<EngineOutcome, EngineError>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
