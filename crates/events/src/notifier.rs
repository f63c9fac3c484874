//! Per-task subscriber registry.
//!
//! Every task owns one [`Notifier`]. Listeners register an unbounded
//! `mpsc` sender and receive each [`TaskNotification`] in emission order.
//! Unlike the [`EventBus`](crate::bus::EventBus), delivery is lossless: a
//! slow listener never misses a terminal event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use simrun_core::types::TaskId;
use tokio::sync::mpsc;

use crate::notification::{TaskEvent, TaskKind, TaskNotification};

/// Handle returned by [`Notifier::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Listeners = HashMap<SubscriptionId, mpsc::UnboundedSender<TaskNotification>>;

#[derive(Debug)]
pub struct Notifier {
    task_id: TaskId,
    kind: TaskKind,
    next_id: AtomicU64,
    listeners: Mutex<Listeners>,
}

impl Notifier {
    pub fn new(task_id: TaskId, kind: TaskKind) -> Self {
        Self {
            task_id,
            kind,
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Register a listener channel.
    pub fn subscribe(&self, sender: mpsc::UnboundedSender<TaskNotification>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().insert(id, sender);
        id
    }

    /// Register a fresh channel and return its receiving end.
    pub fn subscribe_channel(
        &self,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<TaskNotification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.subscribe(tx), rx)
    }

    /// Remove a listener. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Deliver `event` to every listener, dropping listeners whose receiver
    /// has gone away.
    pub fn emit(&self, event: TaskEvent) {
        let notification = TaskNotification::new(self.task_id, self.kind, event);
        let mut listeners = self.lock();
        listeners.retain(|id, sender| {
            let delivered = sender.send(notification.clone()).is_ok();
            if !delivered {
                tracing::debug!(task_id = %self.task_id, subscription = id.0, "Dropping closed listener");
            }
            delivered
        });
    }

    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::{FailureKind, TaskFailure};

    fn notifier() -> Notifier {
        Notifier::new(simrun_core::types::new_id(), TaskKind::Execution)
    }

    #[tokio::test]
    async fn events_arrive_in_order() {
        let notifier = notifier();
        let (_, mut rx) = notifier.subscribe_channel();

        notifier.emit(TaskEvent::Progress(0));
        notifier.emit(TaskEvent::Progress(50));
        notifier.emit(TaskEvent::Progress(100));

        let received: Vec<_> = [
            rx.recv().await.expect("first"),
            rx.recv().await.expect("second"),
            rx.recv().await.expect("third"),
        ]
        .into_iter()
        .map(|n| n.event)
        .collect();
        assert_eq!(
            received,
            vec![
                TaskEvent::Progress(0),
                TaskEvent::Progress(50),
                TaskEvent::Progress(100)
            ]
        );
    }

    #[tokio::test]
    async fn every_listener_receives_events() {
        let notifier = notifier();
        let (_, mut a) = notifier.subscribe_channel();
        let (_, mut b) = notifier.subscribe_channel();

        notifier.emit(TaskEvent::Error(TaskFailure::new(FailureKind::EngineExecution, "crash")));

        let a = a.recv().await.expect("a");
        let b = b.recv().await.expect("b");
        assert_eq!(a.task_id, notifier.task_id());
        assert!(a.is_terminal());
        assert_eq!(a.event, b.event);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let notifier = notifier();
        let (id, _rx) = notifier.subscribe_channel();
        assert_eq!(notifier.listener_count(), 1);
        assert!(notifier.unsubscribe(id));
        assert!(!notifier.unsubscribe(id));
        assert_eq!(notifier.listener_count(), 0);
    }

    #[test]
    fn unsubscribed_listener_receives_nothing() {
        let notifier = notifier();
        let (id, mut rx) = notifier.subscribe_channel();
        notifier.unsubscribe(id);
        notifier.emit(TaskEvent::Progress(10));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_listeners_are_pruned() {
        let notifier = notifier();
        let (_, rx) = notifier.subscribe_channel();
        drop(rx);
        notifier.emit(TaskEvent::Progress(1));
        assert_eq!(notifier.listener_count(), 0);
    }
}
