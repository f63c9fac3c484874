//! Event journal service.
//!
//! [`EventJournal`] subscribes to the [`EventBus`](crate::bus::EventBus),
//! logs every message and, when a path is configured, appends it as one
//! JSON line. It runs as a long-lived background task and ends when the
//! bus is dropped.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

use crate::bus::BusMessage;

pub struct EventJournal;

impl EventJournal {
    /// Run the journal loop until the channel is closed.
    pub async fn run(mut receiver: broadcast::Receiver<BusMessage>, path: Option<PathBuf>) {
        loop {
            match receiver.recv().await {
                Ok(message) => {
                    tracing::info!(
                        event = message.event.name(),
                        payload = ?message.event,
                        "Scheduler event"
                    );
                    if let Some(path) = &path {
                        if let Err(e) = Self::append(path, &message).await {
                            tracing::error!(
                                error = %e,
                                path = %path.display(),
                                "Failed to append event to journal"
                            );
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event journal lagged, some events were not recorded");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Event bus closed, journal shutting down");
                    break;
                }
            }
        }
    }

    async fn append(path: &Path, message: &BusMessage) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBus, SchedulerEvent};

    #[tokio::test]
    async fn writes_json_lines_until_bus_closes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("journal.jsonl");

        let bus = EventBus::default();
        let handle = tokio::spawn(EventJournal::run(bus.subscribe(), Some(path.clone())));

        let job_id = simrun_core::types::new_id();
        bus.publish(SchedulerEvent::JobQueued { job_id, position: 3 });
        bus.publish(SchedulerEvent::PoolReleased);
        drop(bus);

        handle.await.expect("journal task");

        let content = std::fs::read_to_string(&path).expect("read journal");
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "job_queued");
        assert_eq!(lines[0]["position"], 3);
        assert_eq!(lines[1]["event"], "pool_released");
    }

    #[tokio::test]
    async fn runs_without_path() {
        let bus = EventBus::default();
        let handle = tokio::spawn(EventJournal::run(bus.subscribe(), None));
        bus.publish(SchedulerEvent::PoolReleased);
        drop(bus);
        handle.await.expect("journal task");
    }
}
