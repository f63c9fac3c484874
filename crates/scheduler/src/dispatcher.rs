//! Execution dispatcher.
//!
//! [`Dispatcher`] is a cloneable handle to a single control loop task that
//! owns the [`ExecutionQueue`], the [`WorkerPool`] and the per-task
//! subscriptions. Public methods send a command and await its reply; task
//! notifications are funnelled into the same loop through one channel.
//! Every mutation of the queue and of the admission bookkeeping therefore
//! happens on one task, one message at a time.
//!
//! Admission walks the queue in order and submits `Created` tasks while the
//! pool has capacity, pausing for the configured start delay after each
//! submission. The pause is not interrupted by incoming commands or
//! notifications.
//!
//! An engine failure halts admission and stops the rest of the active
//! batch. A job whose input vanished while it waited is failed in place
//! without being submitted and does not affect the other jobs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use simrun_core::config::SchedulerConfig;
use simrun_core::job_result::JobHandle;
use simrun_core::types::{JobId, TaskId};
use simrun_core::CoreError;
use simrun_events::{
    EventBus, FailureKind, SchedulerEvent, SubscriptionId, TaskEvent, TaskFailure,
    TaskNotification,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::engine::SimulationEngine;
use crate::error::SchedulerError;
use crate::execution_task::{ExecutionContext, ExecutionTask};
use crate::pool::WorkerPool;
use crate::queue::{ExecutionQueue, QueueEntrySnapshot};
use crate::registry::JobRegistry;

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Upper bound for joining task bodies when the loop ends.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStatus {
    /// Tasks currently holding a pool slot.
    pub active: usize,
    /// Entries in the queue, active ones included.
    pub queued: usize,
    /// Entries not currently submitted.
    pub waiting: usize,
    /// A batch was started and has not drained yet.
    pub running: bool,
    /// Admission is suspended after a failure or a stop-all.
    pub halted: bool,
}

impl DispatcherStatus {
    pub fn is_idle(&self) -> bool {
        !self.running && self.active == 0
    }
}

/// What [`Dispatcher::stop_one`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The task was running and was asked to stop.
    StopRequested,
    /// The job was not submitted and was removed from the queue.
    Removed,
}

type Reply<T> = oneshot::Sender<Result<T, SchedulerError>>;

enum Command {
    Enqueue { job: JobHandle, reply: Reply<usize> },
    MoveUp { index: usize, reply: Reply<()> },
    MoveDown { index: usize, reply: Reply<()> },
    RemovePending { job_id: JobId, reply: Reply<JobHandle> },
    StartAll { reply: Reply<usize> },
    StopOne { job_id: JobId, reply: Reply<StopOutcome> },
    StopAll { reply: oneshot::Sender<usize> },
    Snapshot { reply: oneshot::Sender<Vec<QueueEntrySnapshot>> },
    Task { job_id: JobId, reply: oneshot::Sender<Option<Arc<ExecutionTask>>> },
    Shutdown { reply: oneshot::Sender<()> },
}

// ---------------------------------------------------------------------------
// Dispatcher handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Dispatcher {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<DispatcherStatus>,
    additional_steps_for_restart: u64,
}

impl Dispatcher {
    /// Spawn the control loop. It ends on [`Dispatcher::shutdown`], when
    /// `cancel` fires, or when every handle is dropped.
    pub fn start(
        config: &SchedulerConfig,
        engine: Arc<dyn SimulationEngine>,
        registry: Arc<dyn JobRegistry>,
        bus: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(DispatcherStatus::default());

        let control = ControlLoop {
            queue: ExecutionQueue::new(),
            pool: WorkerPool::new("execution", config.number_of_parallel_simulations),
            ctx: Arc::new(ExecutionContext {
                engine,
                results_path: config.results_path.clone(),
                liveness_interval: config.liveness_interval,
            }),
            registry,
            bus,
            delay: config.delay_for_job_start,
            results_path: config.results_path.clone(),
            notify_tx,
            subscriptions: HashMap::new(),
            running: false,
            halted: false,
            cancel,
            status: status_tx,
            shutdown_replies: Vec::new(),
            last_released: None,
        };
        tokio::spawn(control.run(commands_rx, notify_rx));

        Self {
            commands: commands_tx,
            status: status_rx,
            additional_steps_for_restart: config.additional_steps_for_restart,
        }
    }

    /// Append `job` to the queue and return its position.
    ///
    /// While a batch is running the job is wrapped and admitted right away,
    /// subject to the parallelism limit.
    pub async fn enqueue(&self, job: JobHandle) -> Result<usize, SchedulerError> {
        self.request(|reply| Command::Enqueue { job, reply }).await?
    }

    /// Clone a finished job for a restart with the configured extra steps
    /// and enqueue the clone.
    pub async fn enqueue_restart(&self, finished: &JobHandle) -> Result<JobHandle, SchedulerError> {
        let clone = finished
            .read()
            .clone_for_restart(self.additional_steps_for_restart)?;
        let handle = JobHandle::new(clone);
        self.enqueue(handle.clone()).await?;
        Ok(handle)
    }

    pub async fn move_up(&self, index: usize) -> Result<(), SchedulerError> {
        self.request(|reply| Command::MoveUp { index, reply }).await?
    }

    pub async fn move_down(&self, index: usize) -> Result<(), SchedulerError> {
        self.request(|reply| Command::MoveDown { index, reply }).await?
    }

    /// Remove a job whose task is not submitted.
    pub async fn remove_pending(&self, job_id: JobId) -> Result<JobHandle, SchedulerError> {
        self.request(|reply| Command::RemovePending { job_id, reply })
            .await?
    }

    /// Wrap every pending entry into a task and begin admission.
    ///
    /// All entries are validated first; if any has no resolvable input the
    /// call fails with [`SchedulerError::Validation`] and nothing changes.
    /// Returns the number of tasks waiting for admission.
    pub async fn start_all(&self) -> Result<usize, SchedulerError> {
        self.request(|reply| Command::StartAll { reply }).await?
    }

    /// Stop a running job, or remove it if it was not submitted yet.
    pub async fn stop_one(&self, job_id: JobId) -> Result<StopOutcome, SchedulerError> {
        self.request(|reply| Command::StopOne { job_id, reply }).await?
    }

    /// Ask every active task to stop and suspend admission.
    ///
    /// Returns the number of stop requests issued.
    pub async fn stop_all(&self) -> Result<usize, SchedulerError> {
        self.request(|reply| Command::StopAll { reply }).await
    }

    pub async fn snapshot(&self) -> Result<Vec<QueueEntrySnapshot>, SchedulerError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// The task wrapping `job_id`, once a batch start created it.
    pub async fn task(&self, job_id: JobId) -> Result<Option<Arc<ExecutionTask>>, SchedulerError> {
        self.request(|reply| Command::Task { job_id, reply }).await
    }

    /// Subscribe `sender` to the notifications of the task wrapping `job_id`.
    pub async fn subscribe(
        &self,
        job_id: JobId,
        sender: mpsc::UnboundedSender<TaskNotification>,
    ) -> Result<SubscriptionId, SchedulerError> {
        let task = self
            .task(job_id)
            .await?
            .ok_or(SchedulerError::NotFound(job_id))?;
        Ok(task.subscribe(sender))
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub async fn unsubscribe(
        &self,
        job_id: JobId,
        subscription: SubscriptionId,
    ) -> Result<bool, SchedulerError> {
        Ok(self
            .task(job_id)
            .await?
            .is_some_and(|task| task.unsubscribe(subscription)))
    }

    pub fn status(&self) -> DispatcherStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<DispatcherStatus> {
        self.status.clone()
    }

    /// Resolve once no batch is running and no task is active.
    pub async fn wait_until_idle(&self) -> Result<(), SchedulerError> {
        let mut status = self.status.clone();
        status
            .wait_for(DispatcherStatus::is_idle)
            .await
            .map(|_| ())
            .map_err(|_| SchedulerError::DispatcherClosed)
    }

    /// Stop all tasks, wait for them to end and terminate the control loop.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| SchedulerError::DispatcherClosed)?;
        rx.await.map_err(|_| SchedulerError::DispatcherClosed)
    }
}

// ---------------------------------------------------------------------------
// Control loop
// ---------------------------------------------------------------------------

struct ControlLoop {
    queue: ExecutionQueue,
    pool: WorkerPool<ExecutionTask>,
    ctx: Arc<ExecutionContext>,
    registry: Arc<dyn JobRegistry>,
    bus: Arc<EventBus>,
    delay: Duration,
    results_path: PathBuf,
    notify_tx: mpsc::UnboundedSender<TaskNotification>,
    subscriptions: HashMap<TaskId, SubscriptionId>,
    running: bool,
    halted: bool,
    /// Master token; every task gets a child token.
    cancel: CancellationToken,
    status: watch::Sender<DispatcherStatus>,
    shutdown_replies: Vec<oneshot::Sender<()>>,
    last_released: Option<TaskTracker>,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut notifications: mpsc::UnboundedReceiver<TaskNotification>,
    ) {
        tracing::info!(
            limit = self.pool.capacity(),
            delay_ms = self.delay.as_millis() as u64,
            "Execution dispatcher started",
        );
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Execution dispatcher cancelled");
                    self.stop_active();
                    break;
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        tracing::info!("All dispatcher handles dropped");
                        self.stop_active();
                        break;
                    }
                },
                Some(notification) = notifications.recv() => {
                    self.handle_notification(notification).await;
                }
            }

            self.publish_status();
            if !self.shutdown_replies.is_empty() && self.pool.is_idle() {
                break;
            }
        }

        self.finish().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue { job, reply } => {
                let result = self.enqueue(job);
                let queued = result.is_ok();
                let _ = reply.send(result);
                if queued {
                    self.admit_pending().await;
                    self.release_if_idle();
                }
            }
            Command::MoveUp { index, reply } => {
                let _ = reply.send(self.queue.move_up(index));
            }
            Command::MoveDown { index, reply } => {
                let _ = reply.send(self.queue.move_down(index));
            }
            Command::RemovePending { job_id, reply } => {
                let _ = reply.send(self.remove_pending(job_id));
            }
            Command::StartAll { reply } => {
                let result = self.start_all();
                let started = result.is_ok();
                let _ = reply.send(result);
                if started {
                    self.admit_pending().await;
                    self.release_if_idle();
                }
            }
            Command::StopOne { job_id, reply } => {
                let _ = reply.send(self.stop_one(job_id));
            }
            Command::StopAll { reply } => {
                self.halted = true;
                let stopped = self.stop_active();
                tracing::info!(stopped, "Stop requested for all active jobs");
                let _ = reply.send(stopped);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.queue.snapshot());
            }
            Command::Task { job_id, reply } => {
                let task = self
                    .queue
                    .entries()
                    .iter()
                    .find(|e| e.job_id() == job_id)
                    .and_then(|e| e.task().cloned());
                let _ = reply.send(task);
            }
            Command::Shutdown { reply } => {
                tracing::info!(active = self.pool.active_count(), "Execution dispatcher shutting down");
                self.halted = true;
                self.stop_active();
                self.shutdown_replies.push(reply);
            }
        }
    }

    async fn handle_notification(&mut self, notification: TaskNotification) {
        let job_id = notification.task_id;
        match &notification.event {
            TaskEvent::Liveness(liveness) => {
                tracing::trace!(job_id = %job_id, percent = ?liveness.percent, "Job alive");
                return;
            }
            TaskEvent::Progress(percent) if *percent < TaskEvent::COMPLETE => {
                self.bus.publish(SchedulerEvent::JobProgress {
                    job_id,
                    percent: *percent,
                });
                return;
            }
            _ => {}
        }

        let Some(task) = self.pool.release(job_id) else {
            tracing::debug!(job_id = %job_id, "Terminal event for a task that is not active");
            return;
        };
        self.detach(&task);

        match notification.event {
            TaskEvent::Error(failure) if failure.kind == FailureKind::Validation => {
                tracing::warn!(
                    job_id = %job_id,
                    error = %failure.message,
                    "Job failed validation",
                );
                self.bus.publish(SchedulerEvent::JobFailed {
                    job_id,
                    message: failure.message,
                });
            }
            TaskEvent::Error(failure) => {
                tracing::error!(
                    job_id = %job_id,
                    kind = ?failure.kind,
                    error = %failure.message,
                    "Job failed, stopping the active batch",
                );
                self.bus.publish(SchedulerEvent::JobFailed {
                    job_id,
                    message: failure.message,
                });
                self.halted = true;
                self.stop_active();
            }
            _ => {
                let status = task.job_result().read().status;
                self.queue.remove_finished(job_id);
                tracing::info!(
                    job_id = %job_id,
                    status = ?status,
                    active = self.pool.active_count(),
                    "Job completed",
                );
                self.bus.publish(SchedulerEvent::JobCompleted { job_id, status });
            }
        }

        if let Err(e) = self.registry.refresh(&self.results_path).await {
            tracing::warn!(error = %e, "Registry refresh failed");
        }
        self.admit_pending().await;
        self.release_if_idle();
    }

    // ---- queue operations ----

    fn enqueue(&mut self, job: JobHandle) -> Result<usize, SchedulerError> {
        let job_id = job.id();
        if self.queue.position(job_id).is_some() {
            return Err(CoreError::Conflict(format!("Job {job_id} is already queued")).into());
        }
        let valid = job.read().has_valid_input_path();
        let position = self.queue.enqueue(job);
        tracing::info!(job_id = %job_id, position, "Job queued");
        self.bus.publish(SchedulerEvent::JobQueued { job_id, position });

        if self.running {
            if valid {
                self.wrap(position);
            } else {
                tracing::warn!(
                    job_id = %job_id,
                    "Job added to a running batch has no resolvable input, left pending",
                );
            }
        }
        Ok(position)
    }

    fn remove_pending(&mut self, job_id: JobId) -> Result<JobHandle, SchedulerError> {
        let task = self
            .queue
            .position(job_id)
            .and_then(|i| self.queue.entries()[i].task().cloned());
        let job = self.queue.remove_pending(job_id)?;
        if let Some(task) = task {
            self.detach(&task);
        }
        tracing::info!(job_id = %job_id, "Job removed from queue");
        Ok(job)
    }

    fn start_all(&mut self) -> Result<usize, SchedulerError> {
        // Validate every entry before touching any of them.
        for entry in self.queue.entries().iter().filter(|e| e.needs_task()) {
            let job = entry.job().read();
            if !job.has_valid_input_path() {
                return Err(SchedulerError::Validation {
                    job_id: job.id,
                    reason: "job input path is not resolvable".to_string(),
                });
            }
        }

        let to_wrap: Vec<usize> = self
            .queue
            .entries()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.needs_task())
            .map(|(i, _)| i)
            .collect();
        for index in to_wrap {
            self.wrap(index);
        }

        self.halted = false;
        self.running = true;
        self.publish_status();

        let waiting = self.queue.waiting_count();
        tracing::info!(
            waiting,
            limit = self.pool.capacity(),
            "Batch started",
        );
        Ok(waiting)
    }

    fn stop_one(&mut self, job_id: JobId) -> Result<StopOutcome, SchedulerError> {
        if let Some(task) = self.pool.active_tasks().find(|t| t.id() == job_id) {
            task.stop();
            return Ok(StopOutcome::StopRequested);
        }
        if self.queue.position(job_id).is_some() {
            self.remove_pending(job_id)?;
            return Ok(StopOutcome::Removed);
        }
        Err(SchedulerError::NotFound(job_id))
    }

    // ---- admission ----

    /// Submit waiting tasks in queue order while the pool has room.
    async fn admit_pending(&mut self) {
        if !self.running || self.halted {
            return;
        }
        while self.pool.has_capacity() {
            let Some(task) = self.queue.next_admissible() else {
                break;
            };
            let job_id = task.id();
            if !task.job_result().read().has_valid_input_path() {
                if let Err(e) = self.reject(&task) {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to reject job");
                    break;
                }
                continue;
            }
            if let Err(e) = self.pool.admit(task) {
                tracing::error!(job_id = %job_id, error = %e, "Admission failed");
                break;
            }

            let active = self.pool.active_count();
            let limit = self.pool.capacity();
            tracing::info!(job_id = %job_id, active, limit, "Job admitted");
            self.bus.publish(SchedulerEvent::JobAdmitted {
                job_id,
                active,
                limit,
            });
            self.publish_status();

            if !self.delay.is_zero() {
                tracing::debug!(delay_ms = self.delay.as_millis() as u64, "Pausing before next admission");
                tokio::time::sleep(self.delay).await;
            }
        }
    }

    /// End the batch and release the pool once nothing is active.
    fn release_if_idle(&mut self) {
        if !self.pool.is_idle() {
            return;
        }
        self.running = false;
        if let Some(tracker) = self.pool.shutdown() {
            tracing::info!(halted = self.halted, "Execution pool released");
            self.bus.publish(SchedulerEvent::PoolReleased);
            self.last_released = Some(tracker);
        }
    }

    // ---- helpers ----

    fn wrap(&mut self, index: usize) {
        let Some(entry) = self.queue.entries().get(index) else {
            return;
        };
        let task = Arc::new(ExecutionTask::new(
            entry.job().clone(),
            Arc::clone(&self.ctx),
            self.cancel.child_token(),
        ));
        let subscription = task.subscribe(self.notify_tx.clone());
        self.subscriptions.insert(task.id(), subscription);
        self.queue.attach_task(index, task);
    }

    /// Fail a waiting task in place; the rest of the batch carries on.
    fn reject(&mut self, task: &ExecutionTask) -> Result<(), CoreError> {
        let job_id = task.id();
        self.detach(task);
        let failure = TaskFailure::new(
            FailureKind::Validation,
            "Job input path is no longer resolvable",
        );
        let message = failure.message.clone();
        task.reject(failure)?;
        self.bus.publish(SchedulerEvent::JobFailed { job_id, message });
        self.publish_status();
        Ok(())
    }

    fn detach(&mut self, task: &ExecutionTask) {
        if let Some(subscription) = self.subscriptions.remove(&task.id()) {
            task.unsubscribe(subscription);
        }
    }

    fn stop_active(&self) -> usize {
        let mut stopped = 0;
        for task in self.pool.active_tasks() {
            task.stop();
            stopped += 1;
        }
        stopped
    }

    fn publish_status(&self) {
        let next = DispatcherStatus {
            active: self.pool.active_count(),
            queued: self.queue.len(),
            waiting: self.queue.waiting_count(),
            running: self.running,
            halted: self.halted,
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    async fn finish(&mut self) {
        self.running = false;
        if let Some(tracker) = self.pool.shutdown() {
            self.last_released = Some(tracker);
        }
        if let Some(tracker) = self.last_released.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, tracker.wait()).await.is_err() {
                tracing::warn!("Execution tasks still running after shutdown grace period");
            }
        }
        self.publish_status();
        for reply in self.shutdown_replies.drain(..) {
            let _ = reply.send(());
        }
        tracing::info!("Execution dispatcher stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
