//! Job registry collaborator.
//!
//! The registry persists job inputs and results outside the scheduler.
//! The dispatcher only needs to list pending jobs, drop a job and ask for
//! a rescan after a run ended.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use simrun_core::config::RESULT_DIRECTORY_PREFIX;
use simrun_core::job_input::{JobInput, JOB_INPUT_FILE_NAME};
use simrun_core::job_result::{JobHandle, JobResult};
use simrun_core::types::JobId;
use simrun_core::CoreError;

use crate::error::SchedulerError;

#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Jobs stored under `path` that are waiting to be run.
    async fn list_pending(&self, path: &Path) -> Result<Vec<JobHandle>, SchedulerError>;

    /// Delete the stored job `job_id` under `path`.
    ///
    /// `job_id` is the id of a handle returned by `list_pending`.
    async fn remove(&self, path: &Path, job_id: JobId) -> Result<(), SchedulerError>;

    /// Re-read the contents of `path` after it changed.
    async fn refresh(&self, path: &Path) -> Result<(), SchedulerError>;
}

/// Registry over a directory tree: every sub-directory holding a
/// `job_input.json` is one pending job.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsJobRegistry;

impl FsJobRegistry {
    fn scan_inputs(path: &Path) -> Result<Vec<JobInput>, CoreError> {
        let mut dirs = std::fs::read_dir(path)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.join(JOB_INPUT_FILE_NAME).is_file())
            .collect::<Vec<PathBuf>>();
        dirs.sort();

        let mut inputs = Vec::with_capacity(dirs.len());
        for dir in dirs {
            match JobInput::load(&dir) {
                Ok(input) => inputs.push(input),
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "Skipping unreadable job input");
                }
            }
        }
        Ok(inputs)
    }
}

#[async_trait]
impl JobRegistry for FsJobRegistry {
    async fn list_pending(&self, path: &Path) -> Result<Vec<JobHandle>, SchedulerError> {
        let path = path.to_path_buf();
        let inputs = tokio::task::spawn_blocking(move || Self::scan_inputs(&path))
            .await
            .map_err(|e| CoreError::Internal(format!("Registry scan aborted: {e}")))??;

        Ok(inputs
            .into_iter()
            .map(|input| JobHandle::new(JobResult::from_input(input)))
            .collect())
    }

    async fn remove(&self, path: &Path, job_id: JobId) -> Result<(), SchedulerError> {
        let root = path.to_path_buf();
        let inputs = tokio::task::spawn_blocking(move || Self::scan_inputs(&root))
            .await
            .map_err(|e| CoreError::Internal(format!("Registry scan aborted: {e}")))??;

        let input = inputs
            .into_iter()
            .find(|input| input.id == job_id)
            .ok_or(CoreError::NotFound {
                entity: "job input",
                id: job_id,
            })?;
        tokio::fs::remove_dir_all(&input.path)
            .await
            .map_err(CoreError::from)?;
        tracing::info!(job_id = %job_id, path = %input.path.display(), "Job removed from registry");
        Ok(())
    }

    async fn refresh(&self, path: &Path) -> Result<(), SchedulerError> {
        let mut results = 0usize;
        let mut entries = match tokio::fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Registry path does not exist yet");
                return Ok(());
            }
            Err(e) => return Err(CoreError::from(e).into()),
        };
        while let Some(entry) = entries.next_entry().await.map_err(CoreError::from)? {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(RESULT_DIRECTORY_PREFIX) {
                results += 1;
            }
        }
        tracing::debug!(path = %path.display(), results, "Registry refreshed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn store(root: &Path, name: &str) -> JobInput {
        let input = JobInput::new(name, serde_json::json!({}), root.join(name));
        input.save().expect("save");
        input
    }

    #[tokio::test]
    async fn lists_directories_with_job_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = store(dir.path(), "a");
        let b = store(dir.path(), "b");
        std::fs::create_dir(dir.path().join("not-a-job")).expect("mkdir");
        std::fs::create_dir(dir.path().join("broken")).expect("mkdir");
        std::fs::write(dir.path().join("broken").join(JOB_INPUT_FILE_NAME), b"{").expect("write");

        let pending = FsJobRegistry.list_pending(dir.path()).await.expect("list");
        let ids: Vec<_> = pending.iter().map(JobHandle::id).collect();
        assert_eq!(pending.len(), 2);
        assert!(ids.contains(&a.id) && ids.contains(&b.id));
        assert!(pending.iter().all(|j| j.read().has_valid_input_path()));
    }

    #[tokio::test]
    async fn remove_deletes_job_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = store(dir.path(), "a");

        FsJobRegistry.remove(dir.path(), a.id).await.expect("remove");
        assert!(!a.path.exists());
        assert_matches!(
            FsJobRegistry.remove(dir.path(), a.id).await,
            Err(SchedulerError::Core(CoreError::NotFound { .. }))
        );
    }

    #[tokio::test]
    async fn listed_handle_id_removes_its_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = store(dir.path(), "a");
        let b = store(dir.path(), "b");

        let pending = FsJobRegistry.list_pending(dir.path()).await.expect("list");
        let handle = pending
            .iter()
            .find(|j| j.read().description == "b")
            .expect("listed b");
        FsJobRegistry
            .remove(dir.path(), handle.id())
            .await
            .expect("remove by handle id");

        assert!(a.path.is_dir());
        assert!(!b.path.exists());
    }

    #[tokio::test]
    async fn refresh_tolerates_missing_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        FsJobRegistry
            .refresh(&dir.path().join("missing"))
            .await
            .expect("refresh");
        FsJobRegistry.refresh(dir.path()).await.expect("refresh");
    }
}
