//! Restarting finished runs with additional steps.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use common::{harness, job, within};
use serde_json::json;
use simrun_core::config::SchedulerConfig;
use simrun_core::job_result::{JobHandle, JobResult, ProcessingStatus};
use simrun_core::CoreError;
use simrun_scheduler::SchedulerError;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_clone_is_independent_of_original() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = harness(dir.path(), 1, Duration::ZERO);
    let original = job(dir.path(), "membrane", json!({"steps": 2}));
    h.dispatcher.enqueue(original.clone()).await.expect("enqueue");
    h.dispatcher.start_all().await.expect("start");
    within(h.dispatcher.wait_until_idle()).await.expect("idle");

    let restart = h
        .dispatcher
        .enqueue_restart(&original)
        .await
        .expect("enqueue restart");
    {
        let clone = restart.read();
        assert_ne!(clone.id, original.id());
        assert!(clone.is_to_be_restarted());
        assert_eq!(
            clone.additional_steps_for_restart(),
            SchedulerConfig::default().additional_steps_for_restart
        );
        assert_eq!(clone.status, ProcessingStatus::NotStarted);
        assert_eq!(clone.view_lock_count(), 0);
        assert_eq!(clone.restart_source(), original.read().output_path.as_deref());
    }

    // Flags of the clone and the original never leak into each other.
    restart.write().clear_restart();
    restart.write().begin_view();
    let source = original.read();
    assert!(!source.is_to_be_restarted());
    assert!(!source.is_restarted());
    assert_eq!(source.additional_steps_for_restart(), 0);
    assert_eq!(source.view_lock_count(), 0);
    assert_eq!(source.status, ProcessingStatus::FinishedWithSuccess);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restarted_run_starts_from_previous_output() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = harness(dir.path(), 1, Duration::ZERO);
    let original = job(dir.path(), "membrane", json!({"steps": 2}));
    h.dispatcher.enqueue(original.clone()).await.expect("enqueue");
    h.dispatcher.start_all().await.expect("start");
    within(h.dispatcher.wait_until_idle()).await.expect("idle");

    let previous = original.read().output_path.clone().expect("output path");
    std::fs::write(previous.join("checkpoint.bin"), b"state").expect("write checkpoint");

    let restart = h
        .dispatcher
        .enqueue_restart(&original)
        .await
        .expect("enqueue restart");
    h.dispatcher.start_all().await.expect("start restart");
    within(h.dispatcher.wait_until_idle()).await.expect("idle");

    let result = restart.snapshot();
    assert_eq!(result.status, ProcessingStatus::FinishedWithSuccess);
    assert!(result.is_restarted());
    assert!(!result.is_to_be_restarted());
    assert!(result.description.starts_with("membrane"));
    let output = result.output_path.expect("restart output");
    assert_ne!(output, previous);
    assert_eq!(
        std::fs::read(output.join("checkpoint.bin")).expect("copied checkpoint"),
        b"state"
    );
    // The previous run is left untouched.
    assert_eq!(original.read().status, ProcessingStatus::FinishedWithSuccess);
    assert!(previous.join("checkpoint.bin").is_file());
}

#[tokio::test]
async fn unfinished_job_cannot_be_restarted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = harness(dir.path(), 1, Duration::ZERO);
    let pending = JobHandle::new(JobResult::pending("fresh", dir.path().join("input")));

    assert_matches!(
        h.dispatcher.enqueue_restart(&pending).await,
        Err(SchedulerError::Core(CoreError::Conflict(_)))
    );
    assert!(h.dispatcher.snapshot().await.expect("snapshot").is_empty());
}
