//! Scheduler configuration.
//!
//! Values are read from `SIMRUN_*` environment variables (see
//! [`SchedulerConfig::from_env`]). Defaults follow the desktop application's
//! preference defaults; ranges are enforced by [`SchedulerConfig::validate`].

use std::path::PathBuf;
use std::time::Duration;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Environment variable names
// ---------------------------------------------------------------------------

pub const ENV_PARALLEL_SIMULATIONS: &str = "SIMRUN_PARALLEL_SIMULATIONS";
pub const ENV_JOB_START_DELAY_MS: &str = "SIMRUN_JOB_START_DELAY_MS";
pub const ENV_LIVENESS_INTERVAL_MS: &str = "SIMRUN_LIVENESS_INTERVAL_MS";
pub const ENV_ADDITIONAL_RESTART_STEPS: &str = "SIMRUN_ADDITIONAL_RESTART_STEPS";
pub const ENV_RESULTS_PATH: &str = "SIMRUN_RESULTS_PATH";
pub const ENV_ARCHIVE_IN_BACKGROUND: &str = "SIMRUN_ARCHIVE_IN_BACKGROUND";
pub const ENV_ARCHIVE_EXCLUSION_PATTERN: &str = "SIMRUN_ARCHIVE_EXCLUSION_PATTERN";
pub const ENV_ARCHIVE_UNCOMPRESSED: &str = "SIMRUN_ARCHIVE_UNCOMPRESSED";

// ---------------------------------------------------------------------------
// Defaults and limits
// ---------------------------------------------------------------------------

pub const DEFAULT_PARALLEL_SIMULATIONS: usize = 1;

/// Pause between two admissions.
pub const DEFAULT_JOB_START_DELAY_MS: u64 = 1000;
pub const MAX_JOB_START_DELAY_MS: u64 = 60_000;

/// Interval between liveness events of a running job.
pub const DEFAULT_LIVENESS_INTERVAL_MS: u64 = 1000;
pub const MIN_LIVENESS_INTERVAL_MS: u64 = 100;
pub const MAX_LIVENESS_INTERVAL_MS: u64 = 10_000;

pub const DEFAULT_ADDITIONAL_RESTART_STEPS: u64 = 10_000;
pub const MAX_ADDITIONAL_RESTART_STEPS: u64 = 100_000_000;

pub const DEFAULT_RESULTS_PATH: &str = "data/results";

/// Prefix of per-run output directories under the results path.
pub const RESULT_DIRECTORY_PREFIX: &str = "R_";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How results are archived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveConfig {
    /// Queue archives on the serial background pool instead of blocking.
    pub in_background: bool,
    /// Regex matched against file names to leave out of the archive.
    pub exclusion_pattern: Option<String>,
    /// Store entries without compression (faster).
    pub uncompressed: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            in_background: false,
            exclusion_pattern: None,
            uncompressed: true,
        }
    }
}

/// Tunables of the execution and archive dispatchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Upper bound of concurrently submitted execution tasks.
    pub number_of_parallel_simulations: usize,
    pub delay_for_job_start: Duration,
    pub liveness_interval: Duration,
    pub additional_steps_for_restart: u64,
    /// Directory receiving one output directory per run.
    pub results_path: PathBuf,
    pub archive: ArchiveConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            number_of_parallel_simulations: DEFAULT_PARALLEL_SIMULATIONS,
            delay_for_job_start: Duration::from_millis(DEFAULT_JOB_START_DELAY_MS),
            liveness_interval: Duration::from_millis(DEFAULT_LIVENESS_INTERVAL_MS),
            additional_steps_for_restart: DEFAULT_ADDITIONAL_RESTART_STEPS,
            results_path: PathBuf::from(DEFAULT_RESULTS_PATH),
            archive: ArchiveConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Build a validated configuration from the process environment.
    pub fn from_env() -> Result<Self, CoreError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a validated configuration from an arbitrary key lookup.
    ///
    /// Unset or empty keys fall back to the defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CoreError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            number_of_parallel_simulations: parse_or(
                get(ENV_PARALLEL_SIMULATIONS),
                ENV_PARALLEL_SIMULATIONS,
                defaults.number_of_parallel_simulations,
            )?,
            delay_for_job_start: Duration::from_millis(parse_or(
                get(ENV_JOB_START_DELAY_MS),
                ENV_JOB_START_DELAY_MS,
                DEFAULT_JOB_START_DELAY_MS,
            )?),
            liveness_interval: Duration::from_millis(parse_or(
                get(ENV_LIVENESS_INTERVAL_MS),
                ENV_LIVENESS_INTERVAL_MS,
                DEFAULT_LIVENESS_INTERVAL_MS,
            )?),
            additional_steps_for_restart: parse_or(
                get(ENV_ADDITIONAL_RESTART_STEPS),
                ENV_ADDITIONAL_RESTART_STEPS,
                defaults.additional_steps_for_restart,
            )?,
            results_path: get(ENV_RESULTS_PATH)
                .map(PathBuf::from)
                .unwrap_or(defaults.results_path),
            archive: ArchiveConfig {
                in_background: parse_bool_or(
                    get(ENV_ARCHIVE_IN_BACKGROUND),
                    ENV_ARCHIVE_IN_BACKGROUND,
                    defaults.archive.in_background,
                )?,
                exclusion_pattern: get(ENV_ARCHIVE_EXCLUSION_PATTERN),
                uncompressed: parse_bool_or(
                    get(ENV_ARCHIVE_UNCOMPRESSED),
                    ENV_ARCHIVE_UNCOMPRESSED,
                    defaults.archive.uncompressed,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Check every value against its allowed range.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.number_of_parallel_simulations == 0 {
            return Err(CoreError::Validation(
                "Number of parallel simulations must be at least 1".to_string(),
            ));
        }
        let delay_ms = self.delay_for_job_start.as_millis();
        if delay_ms > u128::from(MAX_JOB_START_DELAY_MS) {
            return Err(CoreError::Validation(format!(
                "Job start delay must not exceed {MAX_JOB_START_DELAY_MS} ms, got {delay_ms}"
            )));
        }
        let liveness_ms = self.liveness_interval.as_millis();
        if liveness_ms < u128::from(MIN_LIVENESS_INTERVAL_MS)
            || liveness_ms > u128::from(MAX_LIVENESS_INTERVAL_MS)
        {
            return Err(CoreError::Validation(format!(
                "Liveness interval must be within {MIN_LIVENESS_INTERVAL_MS}..={MAX_LIVENESS_INTERVAL_MS} ms, got {liveness_ms}"
            )));
        }
        if self.additional_steps_for_restart > MAX_ADDITIONAL_RESTART_STEPS {
            return Err(CoreError::Validation(format!(
                "Additional restart steps must not exceed {MAX_ADDITIONAL_RESTART_STEPS}"
            )));
        }
        if let Some(pattern) = &self.archive.exclusion_pattern {
            regex::Regex::new(pattern).map_err(|e| {
                CoreError::Validation(format!("Invalid archive exclusion pattern: {e}"))
            })?;
        }
        Ok(())
    }
}

fn parse_or<T: std::str::FromStr>(
    raw: Option<String>,
    key: &str,
    default: T,
) -> Result<T, CoreError> {
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| {
            CoreError::Validation(format!("{key} has an invalid value: '{value}'"))
        }),
    }
}

fn parse_bool_or(raw: Option<String>, key: &str, default: bool) -> Result<bool, CoreError> {
    match raw.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(CoreError::Validation(format!(
            "{key} must be a boolean, got '{v}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
