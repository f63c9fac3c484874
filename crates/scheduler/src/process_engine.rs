//! [`SimulationEngine`] backed by an external executable.
//!
//! The program is invoked as `<program> [args...] <input_dir> <output_dir>`.
//! Lines of the form `progress <percent> [remaining]` on stdout are turned
//! into liveness updates. A stop request writes a [`STOP_FILE_NAME`] marker
//! into the output directory, which the engine checks between steps; the
//! child is killed if it has not exited after the grace period.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use simrun_events::Liveness;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{ChildStdout, Command};

use crate::engine::{EngineContext, EngineError, EngineOutcome, EngineRequest, SimulationEngine};

/// Marker file that asks the engine to stop after the current step.
pub const STOP_FILE_NAME: &str = "STOP";

/// Environment variable carrying the extra step count of a restart.
pub const ENV_ADDITIONAL_STEPS: &str = "SIMRUN_ADDITIONAL_STEPS";

const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);

/// Maximum stderr captured for error reports (64 KiB).
const MAX_STDERR_BYTES: usize = 64 * 1024;

pub struct ProcessEngine {
    program: PathBuf,
    args: Vec<String>,
    stop_grace: Duration,
}

impl ProcessEngine {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    /// How long a stopped engine may take to exit before it is killed.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }
}

#[async_trait]
impl SimulationEngine for ProcessEngine {
    fn name(&self) -> &str {
        "process"
    }

    async fn run(
        &self,
        request: EngineRequest,
        ctx: EngineContext,
    ) -> Result<EngineOutcome, EngineError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&request.input_path)
            .arg(&request.output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(steps) = request.additional_steps {
            cmd.env(ENV_ADDITIONAL_STEPS, steps.to_string());
        }

        let mut child = cmd.spawn().map_err(EngineError::Spawn)?;
        tracing::debug!(
            job_id = %request.job_id,
            program = %self.program.display(),
            pid = child.id(),
            "Engine process started",
        );

        let progress_task = tokio::spawn(forward_progress(child.stdout.take(), ctx.clone()));
        let stderr_task = tokio::spawn(read_capped(child.stderr.take()));

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = ctx.stop_requested() => None,
        };

        let status = match exited {
            Some(status) => status?,
            None => {
                request_stop(&request.output_path).await;
                match tokio::time::timeout(self.stop_grace, child.wait()).await {
                    Ok(status) => {
                        status?;
                    }
                    Err(_elapsed) => {
                        tracing::warn!(
                            job_id = %request.job_id,
                            grace_ms = self.stop_grace.as_millis() as u64,
                            "Engine ignored stop request, killing process",
                        );
                        child.kill().await?;
                    }
                }
                progress_task.abort();
                stderr_task.abort();
                return Ok(EngineOutcome::Stopped);
            }
        };

        let _ = progress_task.await;
        let stderr = stderr_task.await.unwrap_or_default();

        if status.success() {
            Ok(EngineOutcome::Completed)
        } else if ctx.is_stop_requested() {
            Ok(EngineOutcome::Stopped)
        } else {
            Err(EngineError::Exited {
                code: status.code(),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            })
        }
    }
}

/// Parse a `progress <percent> [remaining]` line.
pub fn parse_progress_line(line: &str) -> Option<Liveness> {
    let mut parts = line.trim().splitn(3, char::is_whitespace);
    if parts.next()? != "progress" {
        return None;
    }
    let percent: u8 = parts.next()?.parse().ok()?;
    let remaining = parts
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Some(Liveness {
        percent: Some(percent.min(100)),
        remaining,
    })
}

async fn forward_progress(stdout: Option<ChildStdout>, ctx: EngineContext) {
    let Some(stdout) = stdout else {
        return;
    };
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(Liveness {
            percent: Some(percent),
            remaining,
        }) = parse_progress_line(&line)
        {
            ctx.report(percent, remaining);
        }
    }
}

/// Read the stream to EOF, keeping the first [`MAX_STDERR_BYTES`].
///
/// Overflow is discarded; the pipe is drained until the child closes it.
async fn read_capped<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    let Some(mut h) = handle else {
        return buf;
    };
    let mut chunk = [0u8; 8 * 1024];
    loop {
        match h.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_STDERR_BYTES.saturating_sub(buf.len());
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    buf
}

async fn request_stop(output_path: &Path) {
    let marker = output_path.join(STOP_FILE_NAME);
    if let Err(e) = tokio::fs::write(&marker, b"").await {
        tracing::warn!(error = %e, path = %marker.display(), "Failed to write stop marker");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tokio::sync::watch;
    use tokio_util::sync::CancellationToken;

    use super::*;

    #[test]
    fn parses_progress_lines() {
        assert_eq!(
            parse_progress_line("progress 42"),
            Some(Liveness {
                percent: Some(42),
                remaining: None
            })
        );
        assert_eq!(
            parse_progress_line("  progress 7 about 3 minutes "),
            Some(Liveness {
                percent: Some(7),
                remaining: Some("about 3 minutes".to_string())
            })
        );
        assert_eq!(parse_progress_line("progress 180").and_then(|l| l.percent), Some(100));
        assert_eq!(parse_progress_line("step 10 done"), None);
        assert_eq!(parse_progress_line("progress lots"), None);
        assert_eq!(parse_progress_line(""), None);
    }

    #[cfg(unix)]
    fn shell_engine(script: &str) -> ProcessEngine {
        ProcessEngine::new(
            "sh",
            vec!["-c".to_string(), script.to_string(), "engine".to_string()],
        )
    }

    #[cfg(unix)]
    fn request(dir: &Path) -> EngineRequest {
        let input = dir.join("input");
        let output = dir.join("output");
        std::fs::create_dir_all(&input).expect("input dir");
        std::fs::create_dir_all(&output).expect("output dir");
        EngineRequest {
            job_id: simrun_core::types::new_id(),
            input_path: input,
            output_path: output,
            parameters: serde_json::Value::Null,
            additional_steps: Some(500),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_run_reports_progress() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = shell_engine(
            r#"echo "progress 50 1 min"; echo "$SIMRUN_ADDITIONAL_STEPS" > "$2/steps.txt"; exit 0"#,
        );
        let (tx, rx) = watch::channel(Liveness::default());
        let request = request(dir.path());
        let output = request.output_path.clone();

        let outcome = engine
            .run(request, EngineContext::new(CancellationToken::new(), tx))
            .await
            .expect("engine run");

        assert_eq!(outcome, EngineOutcome::Completed);
        assert_eq!(rx.borrow().percent, Some(50));
        let steps = std::fs::read_to_string(output.join("steps.txt")).expect("steps file");
        assert_eq!(steps.trim(), "500");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_run_returns_exit_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = shell_engine("echo 'diverged' >&2; exit 3");
        let (tx, _rx) = watch::channel(Liveness::default());

        let result = engine
            .run(request(dir.path()), EngineContext::new(CancellationToken::new(), tx))
            .await;

        assert_matches!(result, Err(EngineError::Exited { code: Some(3), ref stderr }) if stderr == "diverged");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn verbose_stderr_does_not_fail_successful_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Roughly 360 KB of log output, well past the capture limit.
        let engine = shell_engine(
            r#"i=0; while [ $i -lt 6000 ]; do echo "step $i log line padding padding padding" >&2; i=$((i+1)); done; exit 0"#,
        );
        let (tx, _rx) = watch::channel(Liveness::default());

        let outcome = tokio::time::timeout(
            Duration::from_secs(20),
            engine.run(request(dir.path()), EngineContext::new(CancellationToken::new(), tx)),
        )
        .await
        .expect("engine finished within timeout")
        .expect("engine run");
        assert_eq!(outcome, EngineOutcome::Completed);
    }

    #[tokio::test]
    async fn captured_stderr_is_capped() {
        let (mut writer, reader) = tokio::io::duplex(4096);
        let feeder = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let line = vec![b'x'; 1000];
            for _ in 0..200 {
                writer.write_all(&line).await.expect("write");
            }
        });
        let captured = read_capped(Some(reader)).await;
        feeder.await.expect("feeder");
        assert_eq!(captured.len(), MAX_STDERR_BYTES);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_marker_ends_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = shell_engine(r#"while [ ! -f "$2/STOP" ]; do sleep 0.05; done; exit 0"#)
            .with_stop_grace(Duration::from_secs(5));
        let (tx, _rx) = watch::channel(Liveness::default());
        let cancel = CancellationToken::new();
        let ctx = EngineContext::new(cancel.clone(), tx);

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let outcome = engine.run(request(dir.path()), ctx).await.expect("engine run");
        stopper.await.expect("stopper");
        assert_eq!(outcome, EngineOutcome::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unresponsive_engine_is_killed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = shell_engine("sleep 30").with_stop_grace(Duration::from_millis(100));
        let (tx, _rx) = watch::channel(Liveness::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            engine.run(request(dir.path()), EngineContext::new(cancel, tx)),
        )
        .await
        .expect("killed within timeout")
        .expect("engine run");
        assert_eq!(outcome, EngineOutcome::Stopped);
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = ProcessEngine::new(dir.path().join("no-such-engine"), Vec::new());
        let (tx, _rx) = watch::channel(Liveness::default());
        let request = EngineRequest {
            job_id: simrun_core::types::new_id(),
            input_path: dir.path().to_path_buf(),
            output_path: dir.path().to_path_buf(),
            parameters: serde_json::Value::Null,
            additional_steps: None,
        };
        let result = engine
            .run(request, EngineContext::new(CancellationToken::new(), tx))
            .await;
        assert_matches!(result, Err(EngineError::Spawn(_)));
    }
}
