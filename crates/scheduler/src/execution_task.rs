//! Lifecycle wrapper around one simulation run.
//!
//! An [`ExecutionTask`] owns the state machine of a single run of a
//! [`JobHandle`]. The run itself is delegated to the [`SimulationEngine`];
//! the task validates the input, prepares a unique output directory,
//! relays liveness while the engine runs and reports the terminal outcome.
//!
//! The task state is updated before the terminal event is emitted, so a
//! subscriber reacting to `Progress(100)` or `Error` always observes a
//! terminal [`TaskState`]. A panicking engine counts as an engine failure.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use simrun_core::config::RESULT_DIRECTORY_PREFIX;
use simrun_core::job_result::{JobHandle, ProcessingStatus};
use simrun_core::task_state::TaskState;
use simrun_core::types::TaskId;
use simrun_core::CoreError;
use simrun_events::{
    FailureKind, Liveness, Notifier, SubscriptionId, TaskEvent, TaskFailure, TaskKind,
    TaskNotification,
};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::engine::{EngineContext, EngineError, EngineOutcome, EngineRequest, SimulationEngine};
use crate::error::SchedulerError;
use crate::pool::PoolTask;

/// Collaborators shared by every execution task of a dispatcher.
pub struct ExecutionContext {
    pub engine: Arc<dyn SimulationEngine>,
    /// Directory receiving one output directory per run.
    pub results_path: PathBuf,
    pub liveness_interval: Duration,
}

pub struct ExecutionTask {
    id: TaskId,
    job: JobHandle,
    notifier: Notifier,
    state: watch::Sender<TaskState>,
    cancel: CancellationToken,
    ctx: Arc<ExecutionContext>,
    failure: Mutex<Option<TaskFailure>>,
}

impl ExecutionTask {
    /// Wrap `job`. The task shares the job's identity.
    pub fn new(job: JobHandle, ctx: Arc<ExecutionContext>, cancel: CancellationToken) -> Self {
        let id = job.id();
        let (state, _) = watch::channel(TaskState::Created);
        Self {
            id,
            job,
            notifier: Notifier::new(id, TaskKind::Execution),
            state,
            cancel,
            ctx,
            failure: Mutex::new(None),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The wrapped job record.
    pub fn job_result(&self) -> &JobHandle {
        &self.job
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<TaskState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self, sender: mpsc::UnboundedSender<TaskNotification>) -> SubscriptionId {
        self.notifier.subscribe(sender)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }

    /// Ask the engine to stop after its current step. No-op once terminal.
    pub fn stop(&self) {
        if self.state().is_terminal() || self.cancel.is_cancelled() {
            return;
        }
        tracing::info!(job_id = %self.id, "Stop requested");
        self.cancel.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn mark_submitted(&self) -> Result<(), CoreError> {
        self.transition(TaskState::Submitted)
    }

    /// Fail a task that was never submitted, e.g. because its input
    /// vanished while it waited in the queue. The engine is not started.
    pub fn reject(&self, failure: TaskFailure) -> Result<(), CoreError> {
        let current = self.state();
        if current != TaskState::Created {
            return Err(CoreError::InvalidTransition {
                from: current,
                to: TaskState::Failed,
            });
        }
        tracing::warn!(job_id = %self.id, error = %failure.message, "Job rejected before submission");
        self.finish_failed(failure);
        Ok(())
    }

    /// Result of a finished run, `None` while not terminal.
    pub fn outcome(&self) -> Option<Result<(), SchedulerError>> {
        match self.state() {
            TaskState::Finished | TaskState::Stopped => Some(Ok(())),
            TaskState::Failed => {
                let failure = self
                    .failure
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                let error = match failure {
                    Some(TaskFailure {
                        kind: FailureKind::Validation,
                        message,
                    }) => SchedulerError::Validation {
                        job_id: self.id,
                        reason: message,
                    },
                    Some(TaskFailure { message, .. }) => {
                        SchedulerError::EngineExecution(EngineError::Failed(message))
                    }
                    None => SchedulerError::EngineExecution(EngineError::Failed(
                        "unknown failure".to_string(),
                    )),
                };
                Some(Err(error))
            }
            TaskState::Created | TaskState::Submitted => None,
        }
    }

    /// Drive the run to a terminal state.
    pub async fn run(&self) {
        let request = match self.prepare().await {
            Ok(request) => request,
            Err(failure) => {
                tracing::warn!(job_id = %self.id, error = %failure.message, "Job could not be started");
                self.finish_failed(failure);
                return;
            }
        };

        tracing::info!(
            job_id = %self.id,
            engine = self.ctx.engine.name(),
            output = %request.output_path.display(),
            restart_steps = ?request.additional_steps,
            "Simulation started",
        );

        let result = AssertUnwindSafe(self.drive_engine(request))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(EngineError::Failed(format!(
                    "Engine panicked: {}",
                    panic_message(&*panic)
                )))
            });
        self.complete(result);
    }

    // ---- private helpers ----

    /// Validate the job and set up its output directory.
    async fn prepare(&self) -> Result<EngineRequest, TaskFailure> {
        let (input_path, parameters) = {
            let job = self.job.read();
            if !job.has_valid_input_path() {
                let shown = job
                    .resolved_input_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "<none>".to_string());
                return Err(TaskFailure::new(
                    FailureKind::Validation,
                    format!("Job input path is not resolvable: {shown}"),
                ));
            }
            let input_path = job
                .resolved_input_path()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            let parameters = job
                .input
                .as_ref()
                .map(|input| input.parameters.clone())
                .unwrap_or(serde_json::Value::Null);
            (input_path, parameters)
        };

        self.notifier.emit(TaskEvent::Progress(0));
        self.notifier.emit(TaskEvent::Liveness(Liveness::default()));

        let output_path = self.create_output_directory().await.map_err(|e| {
            TaskFailure::new(
                FailureKind::EngineExecution,
                format!("Failed to create output directory: {e}"),
            )
        })?;

        let (restart_source, additional_steps) = {
            let mut job = self.job.write();
            let source = job.mark_restarted();
            let steps = source
                .is_some()
                .then(|| job.additional_steps_for_restart());
            job.mark_running(output_path.clone(), chrono::Utc::now());
            (source, steps)
        };

        if let Some(source) = restart_source {
            let target = output_path.clone();
            let copied = tokio::task::spawn_blocking(move || copy_dir_recursive(&source, &target))
                .await
                .map_err(|e| std::io::Error::other(e.to_string()))
                .and_then(|r| r);
            if let Err(e) = copied {
                return Err(TaskFailure::new(
                    FailureKind::EngineExecution,
                    format!("Failed to copy restart data: {e}"),
                ));
            }
        }

        Ok(EngineRequest {
            job_id: self.id,
            input_path,
            output_path,
            parameters,
            additional_steps,
        })
    }

    async fn create_output_directory(&self) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.ctx.results_path).await?;
        let name = format!(
            "{RESULT_DIRECTORY_PREFIX}{}_{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S"),
            self.id.simple()
        );
        let path = self.ctx.results_path.join(name);
        tokio::fs::create_dir(&path).await?;
        Ok(path)
    }

    /// Run the engine, emitting liveness on every tick.
    async fn drive_engine(&self, request: EngineRequest) -> Result<EngineOutcome, EngineError> {
        let (progress_tx, mut progress_rx) = watch::channel(Liveness::default());
        let engine_ctx = EngineContext::new(self.cancel.clone(), progress_tx);
        let engine = Arc::clone(&self.ctx.engine);

        let run = engine.run(request, engine_ctx);
        tokio::pin!(run);

        let mut ticker = tokio::time::interval(self.ctx.liveness_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; liveness was already sent.
        ticker.tick().await;

        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = ticker.tick() => {
                    let liveness = progress_rx.borrow_and_update().clone();
                    self.job.write().set_alive(liveness.percent, liveness.remaining.clone());
                    self.notifier.emit(TaskEvent::Liveness(liveness));
                }
            }
        }
    }

    fn complete(&self, result: Result<EngineOutcome, EngineError>) {
        let now = chrono::Utc::now();
        match result {
            Ok(EngineOutcome::Completed) => {
                self.job.write().finish(ProcessingStatus::FinishedWithSuccess, now);
                self.write_snapshot();
                self.set_terminal(TaskState::Finished);
                tracing::info!(job_id = %self.id, "Simulation finished");
                self.notifier.emit(TaskEvent::Progress(TaskEvent::COMPLETE));
            }
            Ok(EngineOutcome::Stopped) => {
                {
                    let mut job = self.job.write();
                    job.mark_stopped();
                    job.finish(ProcessingStatus::Stopped, now);
                }
                self.write_snapshot();
                self.set_terminal(TaskState::Stopped);
                tracing::info!(job_id = %self.id, "Simulation stopped");
                self.notifier.emit(TaskEvent::Progress(TaskEvent::COMPLETE));
            }
            Err(e) => {
                tracing::error!(job_id = %self.id, error = %e, "Simulation failed");
                self.finish_failed(TaskFailure::new(FailureKind::EngineExecution, e.to_string()));
            }
        }
    }

    fn finish_failed(&self, failure: TaskFailure) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(failure.clone());
        self.job
            .write()
            .finish(ProcessingStatus::FinishedWithFailure, chrono::Utc::now());
        self.write_snapshot();
        self.set_terminal(TaskState::Failed);
        self.notifier.emit(TaskEvent::Error(failure));
    }

    fn write_snapshot(&self) {
        let result = self.job.snapshot();
        if result.output_path.is_none() {
            return;
        }
        if let Err(e) = result.write_snapshot() {
            tracing::warn!(job_id = %self.id, error = %e, "Failed to write job result snapshot");
        }
    }

    fn set_terminal(&self, next: TaskState) {
        if let Err(e) = self.transition(next) {
            tracing::error!(job_id = %self.id, error = %e, "Task state out of sync");
        }
    }

    fn transition(&self, next: TaskState) -> Result<(), CoreError> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| match state.transition(next) {
            Ok(new_state) => {
                *state = new_state;
                true
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });
        outcome
    }
}

impl PoolTask for ExecutionTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn state(&self) -> TaskState {
        ExecutionTask::state(self)
    }

    fn mark_submitted(&self) -> Result<(), CoreError> {
        ExecutionTask::mark_submitted(self)
    }

    fn execute(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move { self.run().await })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Copy the contents of `source` into the existing directory `target`.
fn copy_dir_recursive(source: &Path, target: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let destination = target.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            std::fs::create_dir_all(&destination)?;
            copy_dir_recursive(&entry.path(), &destination)?;
        } else {
            std::fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
