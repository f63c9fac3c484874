#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use simrun_core::config::SchedulerConfig;
use simrun_core::job_input::JobInput;
use simrun_core::job_result::{JobHandle, JobResult};
use simrun_core::types::JobId;
use simrun_events::EventBus;
use simrun_scheduler::engine::{
    EngineContext, EngineError, EngineOutcome, EngineRequest, SimulationEngine,
};
use simrun_scheduler::registry::JobRegistry;
use simrun_scheduler::{Dispatcher, SchedulerError};
use tokio_util::sync::CancellationToken;

/// Upper bound for any wait in the integration tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Await `future`, failing the test if it takes longer than [`TEST_TIMEOUT`].
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("operation timed out")
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Engine that sleeps through a number of steps, checking the stop flag
/// between them, and records when each run started and ended.
///
/// Per-job behaviour comes from the job parameters: `steps` (default 5),
/// `fail_at` (step index that returns an error) and `panic_at` (step index
/// that panics).
pub struct RecordingEngine {
    step_delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    starts: Mutex<Vec<(JobId, Instant)>>,
    ends: Mutex<Vec<(JobId, Instant)>>,
}

impl RecordingEngine {
    pub fn new(step_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            step_delay,
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
            ends: Mutex::new(Vec::new()),
        })
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> Vec<(JobId, Instant)> {
        self.starts.lock().expect("starts lock").clone()
    }

    pub fn ends(&self) -> Vec<(JobId, Instant)> {
        self.ends.lock().expect("ends lock").clone()
    }

    pub fn started_count(&self) -> usize {
        self.starts.lock().expect("starts lock").len()
    }

    async fn steps(
        &self,
        request: &EngineRequest,
        ctx: &EngineContext,
    ) -> Result<EngineOutcome, EngineError> {
        let steps = request.parameters["steps"].as_u64().unwrap_or(5);
        let fail_at = request.parameters["fail_at"].as_u64();
        let panic_at = request.parameters["panic_at"].as_u64();
        for step in 0..steps {
            if ctx.is_stop_requested() {
                return Ok(EngineOutcome::Stopped);
            }
            if fail_at == Some(step) {
                return Err(EngineError::Failed(format!("diverged at step {step}")));
            }
            if panic_at == Some(step) {
                panic!("engine crashed at step {step}");
            }
            ctx.report((step * 100 / steps) as u8, None);
            tokio::time::sleep(self.step_delay).await;
        }
        Ok(EngineOutcome::Completed)
    }
}

#[async_trait]
impl SimulationEngine for RecordingEngine {
    fn name(&self) -> &str {
        "recording"
    }

    async fn run(
        &self,
        request: EngineRequest,
        ctx: EngineContext,
    ) -> Result<EngineOutcome, EngineError> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        self.starts
            .lock()
            .expect("starts lock")
            .push((request.job_id, Instant::now()));

        let outcome = self.steps(&request, &ctx).await;

        self.ends
            .lock()
            .expect("ends lock")
            .push((request.job_id, Instant::now()));
        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryRegistry {
    jobs: Mutex<HashMap<JobId, JobHandle>>,
    refreshes: AtomicUsize,
}

impl InMemoryRegistry {
    pub fn insert(&self, job: JobHandle) {
        self.jobs.lock().expect("jobs lock").insert(job.id(), job);
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobRegistry for InMemoryRegistry {
    async fn list_pending(&self, _path: &Path) -> Result<Vec<JobHandle>, SchedulerError> {
        Ok(self.jobs.lock().expect("jobs lock").values().cloned().collect())
    }

    async fn remove(&self, _path: &Path, job_id: JobId) -> Result<(), SchedulerError> {
        self.jobs
            .lock()
            .expect("jobs lock")
            .remove(&job_id)
            .map(|_| ())
            .ok_or(SchedulerError::NotFound(job_id))
    }

    async fn refresh(&self, _path: &Path) -> Result<(), SchedulerError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Store a job input under `root/name` and wrap it in a fresh result.
pub fn job(root: &Path, name: &str, parameters: serde_json::Value) -> JobHandle {
    let input = JobInput::new(name, parameters, root.join("inputs").join(name));
    input.save().expect("save job input");
    JobHandle::new(JobResult::from_input(input))
}

pub fn config(root: &Path, limit: usize, delay: Duration) -> SchedulerConfig {
    SchedulerConfig {
        number_of_parallel_simulations: limit,
        delay_for_job_start: delay,
        liveness_interval: Duration::from_millis(100),
        results_path: root.join("results"),
        ..SchedulerConfig::default()
    }
}

pub struct Harness {
    pub dispatcher: Dispatcher,
    pub engine: Arc<RecordingEngine>,
    pub registry: Arc<InMemoryRegistry>,
    pub bus: Arc<EventBus>,
}

pub fn harness(root: &Path, limit: usize, delay: Duration) -> Harness {
    let engine = RecordingEngine::new(Duration::from_millis(10));
    let registry = Arc::new(InMemoryRegistry::default());
    let bus = Arc::new(EventBus::default());
    let dispatcher = Dispatcher::start(
        &config(root, limit, delay),
        engine.clone(),
        registry.clone(),
        bus.clone(),
        CancellationToken::new(),
    );
    Harness {
        dispatcher,
        engine,
        registry,
        bus,
    }
}
