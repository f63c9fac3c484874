//! Archiving through the single-worker archive dispatcher.

mod common;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use common::{harness, job, within};
use serde_json::json;
use simrun_core::job_result::ProcessingStatus;
use simrun_events::{EventBus, SchedulerEvent};
use simrun_scheduler::archive::ArchiveRequest;
use simrun_scheduler::archive_dispatcher::{ArchiveDispatcher, ArchiveSubmission};
use tokio_util::sync::CancellationToken;

/// Directory with `files` files of 16 KiB each, plus one nested log file.
fn populate(root: &Path, name: &str, files: usize) -> PathBuf {
    let dir = root.join(name);
    std::fs::create_dir_all(dir.join("logs")).expect("mkdir");
    let payload = vec![b'7'; 16 * 1024];
    for i in 0..files {
        std::fs::write(dir.join(format!("step_{i:04}.dat")), &payload).expect("write");
    }
    std::fs::write(dir.join("logs").join("engine.log"), b"ok").expect("write");
    dir
}

fn request(source: &Path, destination: PathBuf) -> ArchiveRequest {
    ArchiveRequest {
        source: source.to_path_buf(),
        destination,
        exclusion_pattern: None,
        uncompressed: false,
    }
}

fn zip_names(path: &Path) -> Vec<String> {
    let archive = zip::ZipArchive::new(File::open(path).expect("open zip")).expect("read zip");
    archive.file_names().map(str::to_string).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn background_archives_run_strictly_one_after_another() {
    let dir = tempfile::tempdir().expect("tempdir");
    let first = populate(dir.path(), "first", 150);
    let second = populate(dir.path(), "second", 150);
    let bus = Arc::new(EventBus::default());
    let mut events = bus.subscribe();
    let archives = ArchiveDispatcher::start(Arc::clone(&bus), CancellationToken::new());

    let a = archives
        .submit_archive(request(&first, dir.path().join("out/first.zip")), true)
        .await
        .expect("submit first");
    let b = archives
        .submit_archive(request(&second, dir.path().join("out/second.zip")), true)
        .await
        .expect("submit second");
    let (ArchiveSubmission::Queued(a), ArchiveSubmission::Queued(b)) = (a, b) else {
        panic!("background submissions must be queued");
    };

    let summary_b = within(b.wait()).await.expect("second archive");
    let summary_a = within(a.wait()).await.expect("first archive");
    within(archives.wait_until_idle()).await.expect("idle");
    assert_eq!(summary_a.entries, 151);
    assert_eq!(summary_b.entries, 151);

    let mut lifecycle = Vec::new();
    while let Ok(message) = events.try_recv() {
        match message.event {
            SchedulerEvent::ArchiveStarted { task_id, .. } => {
                lifecycle.push(("started", task_id, message.timestamp));
            }
            SchedulerEvent::ArchiveCompleted { task_id, .. } => {
                lifecycle.push(("completed", task_id, message.timestamp));
            }
            _ => {}
        }
    }
    let order: Vec<_> = lifecycle.iter().map(|(kind, id, _)| (*kind, *id)).collect();
    assert_eq!(
        order,
        vec![
            ("started", a.task_id()),
            ("completed", a.task_id()),
            ("started", b.task_id()),
            ("completed", b.task_id()),
        ]
    );
    assert!(lifecycle[2].2 >= lifecycle[1].2);

    archives.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn foreground_archive_applies_exclusion_pattern() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = populate(dir.path(), "R_run", 3);
    let destination = dir.path().join("R_run.zip");
    let archives = ArchiveDispatcher::start(Arc::new(EventBus::default()), CancellationToken::new());

    let submission = archives
        .submit_archive(
            ArchiveRequest {
                exclusion_pattern: Some(r".*\.log".to_string()),
                uncompressed: true,
                ..request(&source, destination.clone())
            },
            false,
        )
        .await
        .expect("archive");
    let summary = match submission {
        ArchiveSubmission::Completed(summary) => summary,
        ArchiveSubmission::Queued(_) => panic!("foreground archive must complete inline"),
    };

    assert_eq!(summary.entries, 3);
    assert_eq!(summary.excluded, 1);
    let names = zip_names(&destination);
    assert!(names.iter().any(|n| n == "R_run/step_0002.dat"));
    assert!(!names.iter().any(|n| n.ends_with("engine.log")));
    // Foreground archives never occupy the pool.
    assert!(archives.status().is_idle());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn existing_destination_is_rejected_up_front() {
    let dir = tempfile::tempdir().expect("tempdir");
    let source = populate(dir.path(), "run", 1);
    let destination = dir.path().join("run.zip");
    std::fs::write(&destination, b"keep me").expect("write");
    let archives = ArchiveDispatcher::start(Arc::new(EventBus::default()), CancellationToken::new());

    let result = archives
        .submit_archive(request(&source, destination.clone()), true)
        .await;
    assert!(result.is_err());
    assert_eq!(std::fs::read(&destination).expect("read"), b"keep me");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn archiving_a_finished_run_does_not_block_executions() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = harness(dir.path(), 1, Duration::ZERO);
    let first = job(dir.path(), "first", json!({"steps": 2}));
    h.dispatcher.enqueue(first.clone()).await.expect("enqueue");
    h.dispatcher.start_all().await.expect("start");
    within(h.dispatcher.wait_until_idle()).await.expect("idle");

    let output = first.read().output_path.clone().expect("output path");
    let archives = ArchiveDispatcher::start(Arc::clone(&h.bus), CancellationToken::new());
    let submission = archives
        .submit_archive(request(&output, output.with_extension("zip")), true)
        .await
        .expect("submit");

    // A second batch runs while the archive is queued or in flight.
    let second = job(dir.path(), "second", json!({"steps": 2}));
    h.dispatcher.enqueue(second.clone()).await.expect("enqueue");
    h.dispatcher.start_all().await.expect("start");
    within(h.dispatcher.wait_until_idle()).await.expect("idle");
    assert_eq!(second.read().status, ProcessingStatus::FinishedWithSuccess);

    let ArchiveSubmission::Queued(handle) = submission else {
        panic!("background archive must be queued");
    };
    let summary = within(handle.wait()).await.expect("archive");
    assert!(summary.destination.is_file());
    assert!(summary.entries >= 1);
    archives.shutdown().await.expect("shutdown");
}
