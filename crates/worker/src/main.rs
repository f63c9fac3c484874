//! `simrun-worker` -- headless simulation runner.
//!
//! Seeds the execution queue with every pending job found under the input
//! path, runs the whole batch through an external engine program and,
//! optionally, archives each successful result.
//!
//! # Environment variables
//!
//! | Variable                 | Required | Default | Description                                  |
//! |--------------------------|----------|---------|----------------------------------------------|
//! | `SIMRUN_ENGINE_PROGRAM`  | yes      | --      | Engine executable                            |
//! | `SIMRUN_ENGINE_ARGS`     | no       | --      | Whitespace-separated leading arguments       |
//! | `SIMRUN_INPUT_PATH`      | yes      | --      | Directory holding one sub-directory per job  |
//! | `SIMRUN_ARCHIVE_PATH`    | no       | --      | Enables archiving of successful results      |
//! | `SIMRUN_JOURNAL_PATH`    | no       | --      | JSON-lines file receiving scheduler events   |
//!
//! Scheduler tuning (`SIMRUN_PARALLEL_SIMULATIONS`, `SIMRUN_JOB_START_DELAY_MS`,
//! ...) is read by `SchedulerConfig::from_env`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use simrun_core::config::SchedulerConfig;
use simrun_core::job_result::{JobHandle, ProcessingStatus};
use simrun_events::journal::EventJournal;
use simrun_events::EventBus;
use simrun_scheduler::archive::ArchiveRequest;
use simrun_scheduler::archive_dispatcher::{ArchiveDispatcher, ArchiveSubmission};
use simrun_scheduler::process_engine::ProcessEngine;
use simrun_scheduler::registry::{FsJobRegistry, JobRegistry};
use simrun_scheduler::Dispatcher;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Upper bound for draining the event journal on exit.
const JOURNAL_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct WorkerSettings {
    engine_program: PathBuf,
    engine_args: Vec<String>,
    input_path: PathBuf,
    archive_path: Option<PathBuf>,
    journal_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "simrun_worker=info,simrun_scheduler=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let engine_program = std::env::var("SIMRUN_ENGINE_PROGRAM").unwrap_or_else(|_| {
        tracing::error!("SIMRUN_ENGINE_PROGRAM environment variable is required");
        std::process::exit(1);
    });
    let input_path = std::env::var("SIMRUN_INPUT_PATH").unwrap_or_else(|_| {
        tracing::error!("SIMRUN_INPUT_PATH environment variable is required");
        std::process::exit(1);
    });

    let settings = WorkerSettings {
        engine_program: PathBuf::from(engine_program),
        engine_args: std::env::var("SIMRUN_ENGINE_ARGS")
            .map(|args| args.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
        input_path: PathBuf::from(input_path),
        archive_path: std::env::var_os("SIMRUN_ARCHIVE_PATH").map(PathBuf::from),
        journal_path: std::env::var_os("SIMRUN_JOURNAL_PATH").map(PathBuf::from),
    };

    match run(settings).await {
        Ok(failed) if failed > 0 => {
            tracing::warn!(failed, "Worker finished with failed jobs");
            std::process::exit(2);
        }
        Ok(_) => tracing::info!("Worker finished"),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Worker aborted");
            std::process::exit(1);
        }
    }
}

/// Run every pending job once. Returns the number of failed jobs.
async fn run(settings: WorkerSettings) -> anyhow::Result<usize> {
    let config = SchedulerConfig::from_env().context("Invalid scheduler configuration")?;

    tracing::info!(
        engine = %settings.engine_program.display(),
        input = %settings.input_path.display(),
        results = %config.results_path.display(),
        parallel = config.number_of_parallel_simulations,
        "Starting simrun-worker",
    );

    let bus = Arc::new(EventBus::default());
    let journal = tokio::spawn(EventJournal::run(
        bus.subscribe(),
        settings.journal_path.clone(),
    ));
    let cancel = CancellationToken::new();

    let engine = Arc::new(ProcessEngine::new(
        settings.engine_program.clone(),
        settings.engine_args.clone(),
    ));
    let registry = Arc::new(FsJobRegistry);
    let dispatcher = Dispatcher::start(
        &config,
        engine,
        registry.clone(),
        Arc::clone(&bus),
        cancel.child_token(),
    );

    // --- Seed and run the batch ---
    let jobs = registry
        .list_pending(&settings.input_path)
        .await
        .context("Failed to list pending jobs")?;
    if jobs.is_empty() {
        tracing::info!(input = %settings.input_path.display(), "No pending jobs");
    }
    for job in &jobs {
        dispatcher.enqueue(job.clone()).await?;
    }
    if !jobs.is_empty() {
        let waiting = dispatcher.start_all().await?;
        tracing::info!(waiting, "Batch submitted");
        wait_or_stop(&dispatcher).await?;
    }
    dispatcher.shutdown().await?;

    let failed = jobs
        .iter()
        .filter(|job| job.read().status == ProcessingStatus::FinishedWithFailure)
        .count();

    // --- Archive successful results ---
    if let Some(archive_path) = &settings.archive_path {
        let archives = ArchiveDispatcher::start(Arc::clone(&bus), cancel.child_token());
        archive_results(&archives, &config, &jobs, archive_path).await;
        archives.shutdown().await?;
    }

    // --- Shutdown ---
    cancel.cancel();
    drop(bus);
    if tokio::time::timeout(JOURNAL_DRAIN_TIMEOUT, journal).await.is_err() {
        tracing::warn!("Event journal did not drain in time");
    }
    Ok(failed)
}

/// Wait for the batch to drain; Ctrl-C stops every active job first.
async fn wait_or_stop(dispatcher: &Dispatcher) -> anyhow::Result<()> {
    tokio::select! {
        result = dispatcher.wait_until_idle() => return Ok(result?),
        () = shutdown_signal() => {
            let stopped = dispatcher.stop_all().await?;
            tracing::info!(stopped, "Stopping active jobs");
        }
    }
    dispatcher.wait_until_idle().await?;
    Ok(())
}

async fn archive_results(
    archives: &ArchiveDispatcher,
    config: &SchedulerConfig,
    jobs: &[JobHandle],
    archive_path: &Path,
) {
    let mut queued = Vec::new();
    for job in jobs {
        let (job_id, output) = {
            let result = job.read();
            if result.status != ProcessingStatus::FinishedWithSuccess {
                continue;
            }
            let Some(output) = result.output_path.clone() else {
                continue;
            };
            (result.id, output)
        };
        let Some(name) = output.file_name() else {
            continue;
        };
        let request = ArchiveRequest {
            destination: archive_path.join(name).with_extension("zip"),
            source: output,
            exclusion_pattern: config.archive.exclusion_pattern.clone(),
            uncompressed: config.archive.uncompressed,
        };

        match archives
            .submit_archive(request, config.archive.in_background)
            .await
        {
            Ok(ArchiveSubmission::Completed(summary)) => {
                tracing::info!(
                    job_id = %job_id,
                    destination = %summary.destination.display(),
                    entries = summary.entries,
                    "Result archived",
                );
            }
            Ok(ArchiveSubmission::Queued(handle)) => queued.push((job_id, handle)),
            Err(e) => tracing::error!(job_id = %job_id, error = %e, "Archiving failed"),
        }
    }

    for (job_id, handle) in queued {
        match handle.wait().await {
            Ok(summary) => tracing::info!(
                job_id = %job_id,
                destination = %summary.destination.display(),
                entries = summary.entries,
                "Result archived",
            ),
            Err(e) => tracing::error!(job_id = %job_id, error = %e, "Archiving failed"),
        }
    }
}

/// Resolve on SIGINT, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT (Ctrl-C), stopping all jobs"),
        () = terminate => tracing::info!("Received SIGTERM, stopping all jobs"),
    }
}
