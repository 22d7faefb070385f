//! Job model shared by the HTTP surface and the executors.

mod runner;
mod store;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub(crate) use runner::dev_mode;
pub use runner::{
    runner_is_valid, RunnerError, MIN_SUPPORTED_RECORDER_VERSION,
    MIN_SUPPORTED_TRANSCRIBER_VERSION,
};
pub use store::JobStore;

pub const RECORDING_JOB_PREFIX: &str = "calls-recorder";
pub const TRANSCRIBING_JOB_PREFIX: &str = "calls-transcriber";
pub const IMAGE_REGISTRY_DEFAULT: &str = "mattermost";

pub const INPUT_DATA_SITE_URL_KEY: &str = "site_url";

/// Callback invoked exactly once when a job reaches a terminal state.
pub type StopCb = Arc<dyn Fn(Job, bool) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Recording,
    Transcribing,
}

impl JobType {
    /// The workload naming prefix for this job type.
    pub fn job_prefix(&self) -> &'static str {
        match self {
            Self::Recording => RECORDING_JOB_PREFIX,
            Self::Transcribing => TRANSCRIBING_JOB_PREFIX,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Recording => write!(f, "recording"),
            Self::Transcribing => write!(f, "transcribing"),
        }
    }
}

/// Bag of parameters forwarded to the job process as environment variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputData(pub HashMap<String, serde_json::Value>);

impl InputData {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn site_url(&self) -> Option<&str> {
        self.0.get(INPUT_DATA_SITE_URL_KEY).and_then(|v| v.as_str())
    }

    pub fn set_site_url(&mut self, site_url: String) {
        self.0.insert(
            INPUT_DATA_SITE_URL_KEY.to_string(),
            serde_json::Value::String(site_url),
        );
    }

    /// Derive `KEY=value` environment pairs: keys uppercased, values
    /// stringified.
    pub fn to_env(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|(k, v)| format!("{}={}", k.to_uppercase(), stringify_value(v)))
            .collect()
    }
}

fn stringify_value(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid Runner value: {0}")]
    Runner(#[from] RunnerError),

    #[error("invalid MaxDurationSec value: should be positive")]
    InvalidMaxDuration,

    #[error("invalid empty Runners")]
    EmptyRunners,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub max_duration_sec: i64,
    pub runner: String,
    #[serde(default, skip_serializing_if = "InputData::is_empty")]
    pub input_data: InputData,
}

impl JobConfig {
    pub fn is_valid(&self, registry: &str) -> Result<(), JobError> {
        runner_is_valid(&self.runner, registry)?;
        if self.max_duration_sec <= 0 {
            return Err(JobError::InvalidMaxDuration);
        }
        // Job specific input validation is deferred to the job process itself
        // to avoid coupling runner configs with this service.
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(flatten)]
    pub config: JobConfig,
    pub id: String,
    pub start_at: i64,
    #[serde(default, skip_serializing_if = "i64_is_zero")]
    pub stop_at: i64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub output_data: HashMap<String, serde_json::Value>,
}

fn i64_is_zero(v: &i64) -> bool {
    *v == 0
}

/// Executor startup configuration: the runner images expected at service
/// init. The local executor pre-pulls them; the cluster executor ignores it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub runners: Vec<String>,
}

impl ServiceConfig {
    pub fn is_valid(&self, registry: &str) -> Result<(), JobError> {
        if self.runners.is_empty() {
            return Err(JobError::EmptyRunners);
        }
        if registry.is_empty() {
            return Err(JobError::Runner(RunnerError::EmptyRegistry));
        }
        for runner in &self.runners {
            runner_is_valid(runner, registry)?;
        }
        Ok(())
    }
}
