//! Serial archive pipeline.
//!
//! [`ArchiveDispatcher`] runs [`ArchiveTask`]s one at a time in submission
//! order on its own single-slot [`WorkerPool`], independent of the execution
//! dispatcher. A failed archive only fails its own task; the next queued
//! archive starts as usual.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use simrun_core::task_state::TaskState;
use simrun_core::types::TaskId;
use simrun_core::CoreError;
use simrun_events::{EventBus, SchedulerEvent, SubscriptionId, TaskEvent, TaskNotification};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::archive::{ArchiveRequest, ArchiveSummary, ArchiveTask};
use crate::error::SchedulerError;
use crate::pool::WorkerPool;

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Result of [`ArchiveDispatcher::submit_archive`].
#[derive(Debug)]
pub enum ArchiveSubmission {
    /// Ran in the foreground.
    Completed(ArchiveSummary),
    /// Queued on the background pool.
    Queued(ArchiveHandle),
}

/// Tracks an archive queued on the background pool.
#[derive(Debug, Clone)]
pub struct ArchiveHandle {
    task: Arc<ArchiveTask>,
}

impl ArchiveHandle {
    pub fn task_id(&self) -> TaskId {
        self.task.id()
    }

    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    pub fn subscribe(&self, sender: mpsc::UnboundedSender<TaskNotification>) -> SubscriptionId {
        self.task.subscribe(sender)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.task.unsubscribe(id)
    }

    /// Wait for the archive to finish.
    pub async fn wait(&self) -> Result<ArchiveSummary, SchedulerError> {
        let mut state = self.task.watch_state();
        state
            .wait_for(|s| s.is_terminal())
            .await
            .map_err(|_| SchedulerError::DispatcherClosed)?;
        match self.task.outcome() {
            Some(Ok(summary)) => Ok(summary),
            Some(Err(e)) => Err(e.into()),
            None => Err(CoreError::Internal(format!(
                "Archive {} ended without an outcome",
                self.task.id()
            ))
            .into()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStatus {
    pub active: usize,
    pub pending: usize,
}

impl ArchiveStatus {
    pub fn is_idle(&self) -> bool {
        self.active == 0 && self.pending == 0
    }
}

enum ArchiveCommand {
    /// Acknowledged once the task is queued and the status reflects it.
    Submit(Arc<ArchiveTask>, oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

// ---------------------------------------------------------------------------
// ArchiveDispatcher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ArchiveDispatcher {
    commands: mpsc::Sender<ArchiveCommand>,
    status: watch::Receiver<ArchiveStatus>,
    bus: Arc<EventBus>,
}

impl ArchiveDispatcher {
    pub fn start(bus: Arc<EventBus>, cancel: CancellationToken) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ArchiveStatus::default());

        let control = ArchiveLoop {
            pending: VecDeque::new(),
            pool: WorkerPool::new("archive", 1),
            notify_tx,
            subscriptions: HashMap::new(),
            bus: Arc::clone(&bus),
            status: status_tx,
            cancel,
            shutdown_replies: Vec::new(),
            last_released: None,
        };
        tokio::spawn(control.run(commands_rx, notify_rx));

        Self {
            commands: commands_tx,
            status: status_rx,
            bus,
        }
    }

    /// Archive `request.source` into `request.destination`.
    ///
    /// In the foreground the call returns once the archive is written; in
    /// the background it returns a handle as soon as the task is queued.
    pub async fn submit_archive(
        &self,
        request: ArchiveRequest,
        in_background: bool,
    ) -> Result<ArchiveSubmission, SchedulerError> {
        let task = Arc::new(ArchiveTask::new(&request)?);

        if !in_background {
            self.bus.publish(SchedulerEvent::ArchiveStarted {
                task_id: task.id(),
                source: request.source.clone(),
            });
            let task_id = task.id();
            return match task.run_async().await {
                Ok(summary) => {
                    self.bus.publish(SchedulerEvent::ArchiveCompleted {
                        task_id,
                        destination: summary.destination.clone(),
                        entries: summary.entries,
                    });
                    Ok(ArchiveSubmission::Completed(summary))
                }
                Err(e) => {
                    self.bus.publish(SchedulerEvent::ArchiveFailed {
                        task_id,
                        message: e.to_string(),
                    });
                    Err(e.into())
                }
            };
        }

        let handle = ArchiveHandle {
            task: Arc::clone(&task),
        };
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ArchiveCommand::Submit(task, tx))
            .await
            .map_err(|_| SchedulerError::DispatcherClosed)?;
        rx.await.map_err(|_| SchedulerError::DispatcherClosed)?;
        Ok(ArchiveSubmission::Queued(handle))
    }

    pub fn status(&self) -> ArchiveStatus {
        *self.status.borrow()
    }

    /// Resolve once no archive is running or queued.
    pub async fn wait_until_idle(&self) -> Result<(), SchedulerError> {
        let mut status = self.status.clone();
        status
            .wait_for(ArchiveStatus::is_idle)
            .await
            .map(|_| ())
            .map_err(|_| SchedulerError::DispatcherClosed)
    }

    /// Finish the queued archives, then end the control loop.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ArchiveCommand::Shutdown(tx))
            .await
            .map_err(|_| SchedulerError::DispatcherClosed)?;
        rx.await.map_err(|_| SchedulerError::DispatcherClosed)
    }
}

// ---------------------------------------------------------------------------
// Control loop
// ---------------------------------------------------------------------------

struct ArchiveLoop {
    pending: VecDeque<Arc<ArchiveTask>>,
    pool: WorkerPool<ArchiveTask>,
    notify_tx: mpsc::UnboundedSender<TaskNotification>,
    subscriptions: HashMap<TaskId, SubscriptionId>,
    bus: Arc<EventBus>,
    status: watch::Sender<ArchiveStatus>,
    cancel: CancellationToken,
    shutdown_replies: Vec<oneshot::Sender<()>>,
    last_released: Option<TaskTracker>,
}

impl ArchiveLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ArchiveCommand>,
        mut notifications: mpsc::UnboundedReceiver<TaskNotification>,
    ) {
        tracing::info!("Archive dispatcher started");
        let cancel = self.cancel.clone();
        let mut closed = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(
                        pending = self.pending.len(),
                        "Archive dispatcher cancelled, queued archives dropped",
                    );
                    break;
                }
                command = commands.recv(), if !closed => match command {
                    Some(ArchiveCommand::Submit(task, ack)) => {
                        self.enqueue(task);
                        self.admit_next();
                        self.publish_status();
                        let _ = ack.send(());
                    }
                    Some(ArchiveCommand::Shutdown(reply)) => self.shutdown_replies.push(reply),
                    None => closed = true,
                },
                Some(notification) = notifications.recv() => self.handle_notification(notification),
            }

            self.admit_next();
            self.release_if_idle();
            self.publish_status();

            let idle = self.pool.is_idle() && self.pending.is_empty();
            if idle && (closed || !self.shutdown_replies.is_empty()) {
                break;
            }
        }

        if let Some(tracker) = self.pool.shutdown() {
            self.last_released = Some(tracker);
        }
        if let Some(tracker) = self.last_released.take() {
            tracker.wait().await;
        }
        for reply in self.shutdown_replies.drain(..) {
            let _ = reply.send(());
        }
        tracing::info!("Archive dispatcher stopped");
    }

    fn enqueue(&mut self, task: Arc<ArchiveTask>) {
        let subscription = task.subscribe(self.notify_tx.clone());
        self.subscriptions.insert(task.id(), subscription);
        tracing::info!(
            task_id = %task.id(),
            source = %task.source().display(),
            position = self.pending.len(),
            "Archive queued",
        );
        self.pending.push_back(task);
    }

    fn admit_next(&mut self) {
        while self.pool.has_capacity() {
            let Some(task) = self.pending.pop_front() else {
                break;
            };
            let task_id = task.id();
            let source = task.source().to_path_buf();
            match self.pool.admit(task) {
                Ok(()) => self.bus.publish(SchedulerEvent::ArchiveStarted { task_id, source }),
                Err(e) => {
                    tracing::error!(task_id = %task_id, error = %e, "Archive admission failed");
                }
            }
        }
    }

    fn handle_notification(&mut self, notification: TaskNotification) {
        if !notification.is_terminal() {
            if let TaskEvent::Progress(percent) = notification.event {
                tracing::trace!(task_id = %notification.task_id, percent, "Archive progress");
            }
            return;
        }
        let Some(task) = self.pool.release(notification.task_id) else {
            return;
        };
        if let Some(subscription) = self.subscriptions.remove(&task.id()) {
            task.unsubscribe(subscription);
        }

        match notification.event {
            TaskEvent::Error(failure) => {
                self.bus.publish(SchedulerEvent::ArchiveFailed {
                    task_id: task.id(),
                    message: failure.message,
                });
            }
            _ => {
                let entries = task
                    .outcome()
                    .and_then(Result::ok)
                    .map_or(0, |summary| summary.entries);
                self.bus.publish(SchedulerEvent::ArchiveCompleted {
                    task_id: task.id(),
                    destination: task.destination().to_path_buf(),
                    entries,
                });
            }
        }
    }

    fn release_if_idle(&mut self) {
        if self.pool.is_idle() && self.pending.is_empty() {
            if let Some(tracker) = self.pool.shutdown() {
                self.last_released = Some(tracker);
            }
        }
    }

    fn publish_status(&self) {
        let next = ArchiveStatus {
            active: self.pool.active_count(),
            pending: self.pending.len(),
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
