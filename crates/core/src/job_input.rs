//! Persisted simulation job definition.
//!
//! A [`JobInput`] is created and edited by an external collaborator (the
//! job registry); the scheduler only reads it. It is stored as
//! [`JOB_INPUT_FILE_NAME`] inside its own directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{new_id, JobId, Timestamp};

/// File name of the serialized job input inside its directory.
pub const JOB_INPUT_FILE_NAME: &str = "job_input.json";

/// Version written into newly created inputs and results.
pub const APPLICATION_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A saved simulation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInput {
    pub id: JobId,
    pub description: String,
    pub created_at: Timestamp,
    /// Application version that wrote this input.
    pub version: String,
    /// Opaque parameter set handed to the simulation engine.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Directory holding the stored definition.
    pub path: PathBuf,
}

impl JobInput {
    /// Create a new input stored at `path`.
    pub fn new(
        description: impl Into<String>,
        parameters: serde_json::Value,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: new_id(),
            description: description.into(),
            created_at: chrono::Utc::now(),
            version: APPLICATION_VERSION.to_string(),
            parameters,
            path: path.into(),
        }
    }

    /// Load an input from `dir/job_input.json`.
    ///
    /// The stored `path` is replaced by `dir` so moved directories stay
    /// resolvable.
    pub fn load(dir: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read(dir.join(JOB_INPUT_FILE_NAME))?;
        let mut input: JobInput = serde_json::from_slice(&raw).map_err(|e| {
            CoreError::Validation(format!("Malformed job input in {}: {e}", dir.display()))
        })?;
        input.path = dir.to_path_buf();
        Ok(input)
    }

    /// Write this input to `self.path/job_input.json`, creating the directory.
    pub fn save(&self) -> Result<(), CoreError> {
        std::fs::create_dir_all(&self.path)?;
        let json = serde_json::to_vec_pretty(self)
            .map_err(|e| CoreError::Internal(format!("Failed to serialize job input: {e}")))?;
        std::fs::write(self.path.join(JOB_INPUT_FILE_NAME), json)?;
        Ok(())
    }

    /// Whether the stored definition directory still exists.
    pub fn has_valid_path(&self) -> bool {
        self.path.is_dir()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
