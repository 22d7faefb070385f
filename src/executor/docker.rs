//! Local executor backed by the Docker daemon.
//!
//! Every workload is a single container labeled with the service label and
//! its job id, mounting a named volume at `/data`. A per-job supervisor task
//! waits on the container and runs the stop callback exactly once; a
//! background retention loop sweeps exited containers past the configured
//! retention window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::volume::CreateVolumeOptions;
use bollard::Docker;
use futures::StreamExt;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::JobsConfig;
use crate::error::ExecutorError;
use crate::jobs::{self, Job, JobConfig, ServiceConfig, StopCb};

use super::{
    rewrite_loopback_site_url, with_timeout, workload_name, Executor, APP_LABEL_KEY,
    APP_LABEL_VALUE, IMAGE_PULL_TIMEOUT, JOB_ID_LABEL_KEY, REQUEST_TIMEOUT, STOP_TIMEOUT,
};

const VOLUME_PATH: &str = "/data";
const RETENTION_TICK: Duration = Duration::from_secs(60);

// The recorder drives Chromium, which needs an unconfined seccomp profile.
const SECURITY_OPTS: &[&str] = &["seccomp=unconfined"];

pub struct DockerJobService {
    cfg: JobsConfig,
    client: Docker,
    retention_stop: CancellationToken,
    retention_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DockerJobService {
    pub async fn new(cfg: JobsConfig) -> Result<Self, ExecutorError> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| ExecutorError::failed("failed to create docker client", e))?;

        let version = with_timeout(
            REQUEST_TIMEOUT,
            "failed to get server version",
            client.version(),
        )
        .await?;
        tracing::info!(
            version = version.version.as_deref().unwrap_or("unknown"),
            api_version = version.api_version.as_deref().unwrap_or("unknown"),
            "connected to docker API"
        );

        let retention_stop = CancellationToken::new();
        let retention_handle = if cfg.failed_jobs_retention_time.is_zero() {
            None
        } else {
            Some(spawn_retention_loop(
                client.clone(),
                cfg.failed_jobs_retention_time.as_duration(),
                retention_stop.clone(),
            ))
        };

        Ok(Self {
            cfg,
            client,
            retention_stop,
            retention_handle: Mutex::new(retention_handle),
        })
    }

    /// Pull the runner image unless it is already present. The outer check
    /// matters when running locally against images that exist on the host
    /// but not in any registry.
    async fn update_job_runner(&self, runner: &str) -> Result<(), ExecutorError> {
        pull_runner(self.client.clone(), runner.to_string()).await
    }

    /// Resolve a container from the bare job id through the `job_id` label.
    async fn find_container(&self, job_id: &str) -> Result<String, ExecutorError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{JOB_ID_LABEL_KEY}={job_id}")],
        );

        let containers = with_timeout(
            REQUEST_TIMEOUT,
            "failed to list containers",
            self.client.list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            })),
        )
        .await?;

        containers
            .into_iter()
            .find_map(|c| c.id)
            .ok_or(ExecutorError::NotFound)
    }

    /// Count workloads carrying the service label, running only.
    async fn active_jobs(&self) -> Result<usize, ExecutorError> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{APP_LABEL_KEY}={APP_LABEL_VALUE}")],
        );

        let containers = with_timeout(
            REQUEST_TIMEOUT,
            "failed to list containers",
            self.client.list_containers(Some(ListContainersOptions::<String> {
                all: false,
                filters,
                ..Default::default()
            })),
        )
        .await?;

        Ok(containers.len())
    }

    fn spawn_supervisor(&self, job: Job, container_name: String, on_stop: StopCb) {
        let client = self.client.clone();
        // We wait for the container to exit to cover both the case of
        // unexpected error and the execution reaching max_duration_sec. The
        // provided callback updates the caller about this occurrence.
        tokio::spawn(async move {
            let max_duration = Duration::from_secs(job.config.max_duration_sec.max(0) as u64);

            let mut wait = Box::pin(client.wait_container(
                &container_name,
                Some(WaitContainerOptions {
                    condition: "not-running",
                }),
            ));

            let success = match tokio::time::timeout(max_duration, wait.next()).await {
                Ok(Some(Ok(res))) => {
                    tracing::debug!(
                        job_id = %job.id,
                        exit_code = res.status_code,
                        "container exited"
                    );
                    res.status_code == 0
                }
                Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError {
                    code, ..
                }))) => {
                    tracing::debug!(job_id = %job.id, exit_code = code, "container exited");
                    false
                }
                Ok(Some(Err(e))) => {
                    tracing::error!(job_id = %job.id, error = %e, "failed to wait for container");
                    return;
                }
                Ok(None) => {
                    tracing::error!(job_id = %job.id, "container wait stream closed");
                    return;
                }
                Err(_) => {
                    tracing::warn!(job_id = %job.id, "timeout reached, stopping job");

                    if let Err(e) = stop_container(&client, &container_name).await {
                        tracing::error!(job_id = %job.id, error = %e, "failed to stop job");
                        return;
                    }

                    // A single inspection to recover the exit code for the log.
                    match with_timeout(
                        REQUEST_TIMEOUT,
                        "failed to inspect container",
                        client.inspect_container(&container_name, None::<InspectContainerOptions>),
                    )
                    .await
                    {
                        Ok(cnt) => {
                            let exit_code =
                                cnt.state.and_then(|s| s.exit_code).unwrap_or_default();
                            tracing::debug!(
                                job_id = %job.id,
                                exit_code,
                                "container stopped on deadline"
                            );
                        }
                        Err(e) => {
                            tracing::error!(job_id = %job.id, error = %e, "failed to inspect container");
                        }
                    }

                    false
                }
            };

            if let Err(e) = on_stop(job.clone(), success).await {
                tracing::error!(job_id = %job.id, error = %e, "failed to run onStopCb");
            }
        });
    }
}

#[async_trait]
impl Executor for DockerJobService {
    async fn init(&self, cfg: ServiceConfig) -> Result<(), ExecutorError> {
        cfg.is_valid(&self.cfg.image_registry)
            .map_err(|e| ExecutorError::InvalidConfig(format!("invalid service config: {e}")))?;

        // Pull every runner in parallel, failing fast on the first error.
        let mut set = JoinSet::new();
        for runner in cfg.runners {
            set.spawn(pull_runner(self.client.clone(), runner));
        }
        while let Some(res) = set.join_next().await {
            let res = res.map_err(|e| ExecutorError::failed("failed to join pull task", e))?;
            if let Err(e) = res {
                set.abort_all();
                return Err(e);
            }
        }
        Ok(())
    }

    async fn create_job(&self, cfg: JobConfig, on_stop: StopCb) -> Result<Job, ExecutorError> {
        let mut cfg = cfg;
        cfg.is_valid(&self.cfg.image_registry)
            .map_err(|e| ExecutorError::InvalidConfig(format!("invalid job config: {e}")))?;

        let dev_mode = jobs::dev_mode();

        let active = self.active_jobs().await?;
        if active >= self.cfg.max_concurrent_jobs.max(0) as usize {
            if !dev_mode {
                return Err(ExecutorError::MaxConcurrentJobs);
            }
            tracing::warn!(
                active_jobs = active,
                max_concurrent_jobs = self.cfg.max_concurrent_jobs,
                "max concurrent jobs reached"
            );
        }

        let prefix = cfg.job_type.job_prefix();
        let mut env = Vec::new();
        let mut network_mode: Option<String> = None;

        if dev_mode {
            env.push("DEV_MODE=true".to_string());
            // Use the local image when running in dev mode.
            cfg.runner = format!("{prefix}:master");
            if cfg!(target_os = "linux") {
                network_mode = Some("host".to_string());
            } else if let Some(site_url) = cfg.input_data.site_url() {
                let rewritten = rewrite_loopback_site_url(site_url, "host.docker.internal");
                cfg.input_data.set_site_url(rewritten);
            }
        }

        if let Ok(docker_network) = std::env::var("DOCKER_NETWORK") {
            if !docker_network.is_empty() {
                network_mode = Some(docker_network);
            }
        }

        env.extend(cfg.input_data.to_env());

        self.update_job_runner(&cfg.runner).await?;

        let job_id = crate::random::new_id();
        let container_name = workload_name(prefix, &job_id);
        let volume_id = format!("{prefix}-{job_id}");

        with_timeout(
            REQUEST_TIMEOUT,
            "failed to create volume",
            self.client.create_volume(CreateVolumeOptions {
                name: volume_id.clone(),
                ..Default::default()
            }),
        )
        .await?;

        let labels = HashMap::from([
            (APP_LABEL_KEY.to_string(), APP_LABEL_VALUE.to_string()),
            (JOB_ID_LABEL_KEY.to_string(), job_id.clone()),
        ]);

        let host_config = HostConfig {
            network_mode,
            mounts: Some(vec![Mount {
                target: Some(VOLUME_PATH.to_string()),
                source: Some(volume_id.clone()),
                typ: Some(MountTypeEnum::VOLUME),
                ..Default::default()
            }]),
            security_opt: Some(SECURITY_OPTS.iter().map(|s| s.to_string()).collect()),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(cfg.runner.clone()),
            tty: Some(false),
            env: Some(env),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = with_timeout(
            REQUEST_TIMEOUT,
            "failed to create container",
            self.client.create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    ..Default::default()
                }),
                container_config,
            ),
        )
        .await;

        let created = match created {
            Ok(resp) => resp,
            Err(e) => {
                // Don't leak the volume on partial state.
                remove_volume(&self.client, &volume_id).await;
                return Err(e);
            }
        };

        if let Err(e) = with_timeout(
            REQUEST_TIMEOUT,
            "failed to start container",
            self.client
                .start_container(&created.id, None::<StartContainerOptions<String>>),
        )
        .await
        {
            remove_container(&self.client, &created.id).await;
            remove_volume(&self.client, &volume_id).await;
            return Err(e);
        }

        let job = Job {
            config: cfg,
            id: job_id,
            start_at: jobs::now_millis(),
            stop_at: 0,
            output_data: HashMap::new(),
        };

        tracing::info!(job_id = %job.id, container = %container_name, "created and started job container");

        self.spawn_supervisor(job.clone(), container_name, on_stop);

        Ok(job)
    }

    async fn stop_job(&self, job_id: &str) -> Result<(), ExecutorError> {
        let container_id = self.find_container(job_id).await?;
        stop_container(&self.client, &container_id).await
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), ExecutorError> {
        let container_id = self.find_container(job_id).await?;

        let cnt = with_timeout(
            REQUEST_TIMEOUT,
            "failed to get container",
            self.client
                .inspect_container(&container_id, None::<InspectContainerOptions>),
        )
        .await?;

        with_timeout(
            REQUEST_TIMEOUT,
            "failed to remove container",
            self.client
                .remove_container(&container_id, None::<RemoveContainerOptions>),
        )
        .await?;

        let volume = cnt
            .mounts
            .unwrap_or_default()
            .into_iter()
            .find_map(|m| m.name);
        let Some(volume) = volume else {
            return Err(ExecutorError::Failed(
                "container should have one volume".to_string(),
            ));
        };

        with_timeout(
            REQUEST_TIMEOUT,
            "failed to remove volume",
            self.client.remove_volume(&volume, None),
        )
        .await?;

        Ok(())
    }

    async fn job_logs(
        &self,
        job_id: &str,
        stdout: &mut (dyn std::io::Write + Send),
        stderr: &mut (dyn std::io::Write + Send),
    ) -> Result<(), ExecutorError> {
        let container_id = self.find_container(job_id).await?;

        let since = (chrono::Utc::now() - chrono::Duration::hours(1)).timestamp();
        let mut logs = Box::pin(self.client.logs(
            &container_id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                since,
                ..Default::default()
            }),
        ));

        let deadline = tokio::time::Instant::now() + REQUEST_TIMEOUT;
        loop {
            let next = tokio::time::timeout_at(deadline, logs.next()).await;
            match next {
                Ok(Some(Ok(output))) => {
                    let res = match output {
                        LogOutput::StdOut { message } => stdout.write_all(&message),
                        LogOutput::StdErr { message } => stderr.write_all(&message),
                        _ => Ok(()),
                    };
                    res.map_err(|e| ExecutorError::failed("failed to write logs", e))?;
                }
                Ok(Some(Err(e))) => {
                    return Err(ExecutorError::failed("failed to get container logs", e));
                }
                Ok(None) => break,
                Err(_) => {
                    return Err(ExecutorError::failed(
                        "failed to get container logs",
                        "request timed out",
                    ));
                }
            }
        }

        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ExecutorError> {
        tracing::info!("docker job service shutting down");
        self.retention_stop.cancel();
        let handle = self.retention_handle.lock().expect("retention lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        Ok(())
    }
}

async fn pull_runner(client: Docker, runner: String) -> Result<(), ExecutorError> {
    let inspect = with_timeout(
        REQUEST_TIMEOUT,
        "failed to inspect image",
        client.inspect_image(&runner),
    )
    .await;
    if inspect.is_ok() {
        return Ok(());
    }

    tracing::debug!(runner = %runner, "image is missing, will try to pull it from registry");

    let mut stream = Box::pin(client.create_image(
        Some(CreateImageOptions {
            from_image: runner.clone(),
            ..Default::default()
        }),
        None,
        None,
    ));

    let deadline = tokio::time::Instant::now() + IMAGE_PULL_TIMEOUT;
    loop {
        match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(Some(Ok(info))) => {
                if let Some(status) = info.status {
                    tracing::debug!(runner = %runner, "{status}");
                }
            }
            Ok(Some(Err(e))) => {
                return Err(ExecutorError::failed("failed to pull docker image", e));
            }
            Ok(None) => return Ok(()),
            Err(_) => {
                return Err(ExecutorError::failed(
                    "failed to pull docker image",
                    "request timed out",
                ));
            }
        }
    }
}

async fn stop_container(client: &Docker, container_id: &str) -> Result<(), ExecutorError> {
    with_timeout(
        STOP_TIMEOUT + REQUEST_TIMEOUT,
        "failed to stop container",
        client.stop_container(
            container_id,
            Some(StopContainerOptions {
                t: STOP_TIMEOUT.as_secs() as i64,
            }),
        ),
    )
    .await
}

async fn remove_container(client: &Docker, container_id: &str) {
    if let Err(e) = client
        .remove_container(
            container_id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await
    {
        tracing::warn!(container = %container_id, error = %e, "failed to remove container");
    }
}

async fn remove_volume(client: &Docker, volume_id: &str) {
    if let Err(e) = client.remove_volume(volume_id, None).await {
        tracing::warn!(volume = %volume_id, error = %e, "failed to remove volume");
    }
}

fn spawn_retention_loop(
    client: Docker,
    retention: Duration,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tracing::info!(retention_time = ?retention, "starting retention loop");
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(RETENTION_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    tracing::info!("retention loop done");
                    return;
                }
                _ = ticker.tick() => {}
            }
            retention_sweep(&client, retention).await;
        }
    })
}

/// Remove exited containers (and their volumes) past the retention window.
/// Per-container errors are logged and the sweep continues.
async fn retention_sweep(client: &Docker, retention: Duration) {
    let mut filters = HashMap::new();
    filters.insert("status".to_string(), vec!["exited".to_string()]);
    filters.insert(
        "label".to_string(),
        vec![format!("{APP_LABEL_KEY}={APP_LABEL_VALUE}")],
    );

    let containers = match with_timeout(
        REQUEST_TIMEOUT,
        "failed to list containers",
        client.list_containers(Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        })),
    )
    .await
    {
        Ok(containers) => containers,
        Err(e) => {
            tracing::error!(error = %e, "retention sweep failed");
            return;
        }
    };

    let now = chrono::Utc::now();
    for container in containers {
        let Some(id) = container.id else {
            continue;
        };

        let cnt = match with_timeout(
            REQUEST_TIMEOUT,
            "failed to inspect container",
            client.inspect_container(&id, None::<InspectContainerOptions>),
        )
        .await
        {
            Ok(cnt) => cnt,
            Err(e) => {
                tracing::error!(container = %id, error = %e, "retention sweep failed");
                continue;
            }
        };

        let finished_at = cnt.state.as_ref().and_then(|s| s.finished_at.clone());
        if !retention_expired(finished_at.as_deref(), retention, now) {
            continue;
        }

        tracing::info!(container = %id, "removing expired container");

        if let Err(e) = with_timeout(
            REQUEST_TIMEOUT,
            "failed to remove container",
            client.remove_container(&id, None::<RemoveContainerOptions>),
        )
        .await
        {
            tracing::error!(container = %id, error = %e, "retention sweep failed");
            continue;
        }

        if let Some(volume) = cnt
            .mounts
            .unwrap_or_default()
            .into_iter()
            .find_map(|m| m.name)
        {
            remove_volume(client, &volume).await;
        }
    }
}

/// Whether a container that finished at the given RFC3339 time is past the
/// retention window. Unparseable or missing times are never expired.
fn retention_expired(
    finished_at: Option<&str>,
    retention: Duration,
    now: chrono::DateTime<chrono::Utc>,
) -> bool {
    let Some(finished_at) = finished_at else {
        return false;
    };
    let Ok(finished) = chrono::DateTime::parse_from_rfc3339(finished_at) else {
        return false;
    };
    let elapsed = now.signed_duration_since(finished.with_timezone(&chrono::Utc));
    match chrono::Duration::from_std(retention) {
        Ok(retention) => elapsed > retention,
        Err(_) => false,
    }
}
