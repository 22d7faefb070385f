//! Backend-agnostic workload execution.
//!
//! The service holds a single [`Executor`] and never looks through it: every
//! orchestrator-specific type stays inside the respective implementation.
//! Both back-ends share the same lifecycle semantics and label scoping.

pub mod docker;
pub mod kubernetes;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{JobApiType, JobsConfig};
use crate::error::ExecutorError;
use crate::jobs::{Job, JobConfig, ServiceConfig, StopCb};

pub use docker::DockerJobService;
pub use kubernetes::KubernetesJobService;

/// Overall deadline for unary orchestrator calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for image pulls, which can take a while on cold hosts.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(2 * 60);
/// Grace period for stopping a workload before it is killed.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Label attached to every workload this service creates. Enumeration,
/// retention and log fetching are all scoped by it so that neighbors on the
/// same host or cluster are never touched.
pub const APP_LABEL_KEY: &str = "app";
pub const APP_LABEL_VALUE: &str = "mattermost-calls-offloader";

/// Label carrying the job id, used to resolve workloads from the bare id.
pub const JOB_ID_LABEL_KEY: &str = "job_id";

#[async_trait]
pub trait Executor: Send + Sync {
    /// Pre-warm resources needed at startup. The local back-end pulls every
    /// listed runner image in parallel and fails fast on the first error; the
    /// cluster back-end is a no-op.
    async fn init(&self, cfg: ServiceConfig) -> Result<(), ExecutorError>;

    /// Create and start a workload for the given config, then spawn a
    /// supervisor that invokes `on_stop` exactly once when the workload
    /// reaches a terminal state.
    async fn create_job(&self, cfg: JobConfig, on_stop: StopCb) -> Result<Job, ExecutorError>;

    /// Gracefully stop a running workload.
    async fn stop_job(&self, job_id: &str) -> Result<(), ExecutorError>;

    /// Remove the workload and any attached volume. Safe to call on a
    /// terminated job; fails with `not found` if it doesn't exist.
    async fn delete_job(&self, job_id: &str) -> Result<(), ExecutorError>;

    /// Stream the workload's standard streams (most recent hour) into the
    /// provided writers.
    async fn job_logs(
        &self,
        job_id: &str,
        stdout: &mut (dyn std::io::Write + Send),
        stderr: &mut (dyn std::io::Write + Send),
    ) -> Result<(), ExecutorError>;

    /// Release the executor's own background resources.
    async fn shutdown(&self) -> Result<(), ExecutorError>;
}

/// Build the executor selected by `jobs.api_type`.
pub async fn new_executor(cfg: &JobsConfig) -> Result<Arc<dyn Executor>, ExecutorError> {
    match cfg.api_type {
        JobApiType::Docker => Ok(Arc::new(DockerJobService::new(cfg.clone()).await?)),
        JobApiType::Kubernetes => Ok(Arc::new(KubernetesJobService::new(cfg.clone()).await?)),
    }
}

/// Workload (and volume) naming convention shared by both back-ends.
pub(crate) fn workload_name(prefix: &str, job_id: &str) -> String {
    format!("{prefix}-job-{job_id}")
}

/// Bound an orchestrator call by a deadline, wrapping failures with the
/// failing step.
pub(crate) async fn with_timeout<T, E: std::fmt::Display>(
    duration: Duration,
    context: &str,
    fut: impl std::future::Future<Output = Result<T, E>>,
) -> Result<T, ExecutorError> {
    match tokio::time::timeout(duration, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(ExecutorError::failed(context, e)),
        Err(_) => Err(ExecutorError::failed(context, "request timed out")),
    }
}

/// Rewrite a loopback `site_url` to the container-host alias so a job running
/// inside the local daemon (or minikube) can reach a dev server on the host.
pub(crate) fn rewrite_loopback_site_url(site_url: &str, host_alias: &str) -> String {
    let Ok(mut u) = url::Url::parse(site_url) else {
        return site_url.to_string();
    };
    match u.host_str() {
        Some("localhost") | Some("127.0.0.1") => {}
        _ => return site_url.to_string(),
    }
    if u.set_host(Some(host_alias)).is_err() {
        return site_url.to_string();
    }
    let mut out = u.to_string();
    if !site_url.ends_with('/') && out.ends_with('/') {
        out.pop();
    }
    out
}
