//! Runner image validation and version gating.
//!
//! A runner must reference the configured registry, one of the known job
//! images, and a semantic version tag at or above the per-type minimum.
//! `DEV_MODE`/`TEST_MODE` bypass every check so local images can be used.

use regex::Regex;
use semver::Version;
use thiserror::Error;

use super::{RECORDING_JOB_PREFIX, TRANSCRIBING_JOB_PREFIX};

pub const MIN_SUPPORTED_RECORDER_VERSION: &str = "0.6.0";
pub const MIN_SUPPORTED_TRANSCRIBER_VERSION: &str = "0.1.0";

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("runner should not be empty")]
    EmptyRunner,

    #[error("registry should not be empty")]
    EmptyRegistry,

    #[error("failed to validate runner {0:?}")]
    NoMatch(String),

    #[error("failed to parse version: {0}")]
    InvalidVersion(#[from] semver::Error),

    #[error("actual version ({actual}) is lower than minimum supported version ({min})")]
    VersionTooLow { actual: String, min: String },
}

pub(crate) fn dev_mode() -> bool {
    std::env::var("DEV_MODE").as_deref() == Ok("true")
}

fn test_mode() -> bool {
    std::env::var("TEST_MODE").as_deref() == Ok("true")
}

/// Validate a runner against the configured registry. In DEV or TEST mode all
/// checks are bypassed.
pub fn runner_is_valid(runner: &str, registry: &str) -> Result<(), RunnerError> {
    if dev_mode() || test_mode() {
        return Ok(());
    }
    runner_is_valid_strict(runner, registry)
}

fn runner_is_valid_strict(runner: &str, registry: &str) -> Result<(), RunnerError> {
    if runner.is_empty() {
        return Err(RunnerError::EmptyRunner);
    }
    if registry.is_empty() {
        return Err(RunnerError::EmptyRegistry);
    }

    if let Some(version) = match_runner(runner, registry, RECORDING_JOB_PREFIX) {
        return check_min_version(MIN_SUPPORTED_RECORDER_VERSION, &version);
    }
    if let Some(version) = match_runner(runner, registry, TRANSCRIBING_JOB_PREFIX) {
        return check_min_version(MIN_SUPPORTED_TRANSCRIBER_VERSION, &version);
    }

    Err(RunnerError::NoMatch(runner.to_string()))
}

fn match_runner(runner: &str, registry: &str, prefix: &str) -> Option<String> {
    let re = Regex::new(&format!(
        r"^{}/{}:v((?:0|[1-9]\d*)\.(?:0|[1-9]\d*)\.(?:0|[1-9]\d*))(?:-dev\d*)?$",
        regex::escape(registry),
        prefix,
    ))
    .expect("runner regex");
    re.captures(runner).map(|caps| caps[1].to_string())
}

fn check_min_version(min_version: &str, actual_version: &str) -> Result<(), RunnerError> {
    let min = Version::parse(min_version)?;
    let actual = Version::parse(actual_version)?;

    if actual < min {
        return Err(RunnerError::VersionTooLow {
            actual: actual_version.to_string(),
            min: min_version.to_string(),
        });
    }

    Ok(())
}
