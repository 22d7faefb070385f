//! Cluster executor backed by the Kubernetes batch-job API.
//!
//! Each workload is a batch/v1 Job with a single pod, no retries, and an
//! active deadline equal to the job's max duration. The per-job supervisor
//! consumes a label-scoped watch stream; retention of finished jobs is
//! delegated to `ttlSecondsAfterFinished`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::batch::v1::{Job as BatchJob, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, PersistentVolumeClaimVolumeSource, Pod, PodSpec,
    PodTemplateSpec, ResourceRequirements, SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::runtime::watcher;
use kube::Client;

use crate::config::JobsConfig;
use crate::error::ExecutorError;
use crate::jobs::{self, InputData, Job, JobConfig, JobType, ServiceConfig, StopCb};

use super::{
    rewrite_loopback_site_url, with_timeout, workload_name, Executor, APP_LABEL_KEY,
    APP_LABEL_VALUE, JOB_ID_LABEL_KEY, REQUEST_TIMEOUT, STOP_TIMEOUT,
};

const NAMESPACE_DEFAULT: &str = "default";
const INIT_CONTAINER_IMAGE: &str = "busybox:1.36";
const VOLUME_PATH: &str = "/data";
const JOB_NAME_LABEL_KEY: &str = "job_name";

pub struct KubernetesJobService {
    cfg: JobsConfig,
    client: Client,
    namespace: String,
    resource_requirements: HashMap<JobType, ResourceRequirements>,
}

impl KubernetesJobService {
    pub async fn new(cfg: JobsConfig) -> Result<Self, ExecutorError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ExecutorError::failed("failed to create kubernetes client", e))?;

        let version = with_timeout(
            REQUEST_TIMEOUT,
            "failed to get kubernetes server version",
            client.apiserver_version(),
        )
        .await?;

        let namespace = match std::env::var("K8S_NAMESPACE") {
            Ok(ns) if !ns.is_empty() => ns,
            _ => {
                tracing::info!("k8s namespace not provided, using default");
                NAMESPACE_DEFAULT.to_string()
            }
        };

        tracing::info!(
            version = %format!("{}.{}", version.major, version.minor),
            git_version = %version.git_version,
            namespace = %namespace,
            "connected to kubernetes API"
        );

        let resource_requirements =
            parse_resource_requirements(&cfg.kubernetes.jobs_resource_requirements)?;

        Ok(Self {
            cfg,
            client,
            namespace,
            resource_requirements,
        })
    }

    fn jobs_api(&self) -> Api<BatchJob> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods_api(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Resolve the batch job carrying the given job id label.
    async fn find_job(&self, job_id: &str) -> Result<BatchJob, ExecutorError> {
        let lp = ListParams::default().labels(&format!("{JOB_ID_LABEL_KEY}={job_id}"));
        let list = with_timeout(
            REQUEST_TIMEOUT,
            "failed to list jobs",
            self.jobs_api().list(&lp),
        )
        .await?;

        list.items.into_iter().next().ok_or(ExecutorError::NotFound)
    }

    fn spawn_supervisor(&self, job: Job, job_name: String, on_stop: StopCb) {
        let api = self.jobs_api();
        // We watch for the job to complete to cover both the case of
        // unexpected error and the execution reaching max_duration_sec. The
        // provided callback updates the caller about this occurrence.
        tokio::spawn(async move {
            let timeout =
                Duration::from_secs(job.config.max_duration_sec.max(0) as u64) + STOP_TIMEOUT;
            let deadline = tokio::time::Instant::now() + timeout;

            let stream = watcher(
                api,
                watcher::Config::default().labels(&format!("{JOB_NAME_LABEL_KEY}={job_name}")),
            );
            futures::pin_mut!(stream);

            let mut success = false;
            loop {
                match tokio::time::timeout_at(deadline, stream.next()).await {
                    Ok(Some(Ok(event))) => match event {
                        watcher::Event::Applied(jb) => match job_outcome(&jb) {
                            Some(true) => {
                                tracing::info!(job_id = %job.id, "job succeeded");
                                success = true;
                                break;
                            }
                            Some(false) => {
                                tracing::error!(job_id = %job.id, "job failed");
                                break;
                            }
                            None => {}
                        },
                        watcher::Event::Restarted(jbs) => {
                            match jbs.iter().find_map(job_outcome) {
                                Some(true) => {
                                    tracing::info!(job_id = %job.id, "job succeeded");
                                    success = true;
                                    break;
                                }
                                Some(false) => {
                                    tracing::error!(job_id = %job.id, "job failed");
                                    break;
                                }
                                None => {}
                            }
                        }
                        watcher::Event::Deleted(_) => {
                            // Ownership is surrendered silently: someone else
                            // deleted the job, so the callback never runs.
                            tracing::info!(job_id = %job.id, "job was deleted");
                            return;
                        }
                    },
                    Ok(Some(Err(e))) => {
                        // The watcher re-establishes itself; errors here are
                        // transient.
                        tracing::warn!(job_id = %job.id, error = %e, "job watch error");
                    }
                    Ok(None) => {
                        tracing::error!(job_id = %job.id, "job watch stream closed");
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(job_id = %job.id, "timeout reached waiting for job");
                        break;
                    }
                }
            }

            if let Err(e) = on_stop(job.clone(), success).await {
                tracing::error!(job_id = %job.id, error = %e, "failed to run onStopCb");
            }

            tracing::info!(job_id = %job.id, "watcher done");
        });
    }
}

#[async_trait]
impl Executor for KubernetesJobService {
    async fn init(&self, _cfg: ServiceConfig) -> Result<(), ExecutorError> {
        // Leave the cluster's image pulling policy alone: images are pulled
        // upon first pod execution.
        Ok(())
    }

    async fn create_job(&self, cfg: JobConfig, on_stop: StopCb) -> Result<Job, ExecutorError> {
        let mut cfg = cfg;
        cfg.is_valid(&self.cfg.image_registry)
            .map_err(|e| ExecutorError::InvalidConfig(format!("invalid job config: {e}")))?;

        let dev_mode = jobs::dev_mode();

        let lp = ListParams::default().labels(&format!("{APP_LABEL_KEY}={APP_LABEL_VALUE}"));
        let job_list = with_timeout(
            REQUEST_TIMEOUT,
            "failed to list jobs",
            self.jobs_api().list(&lp),
        )
        .await?;
        let active = count_active_jobs(&job_list.items);
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

        if dev_mode {
            if let Some(site_url) = cfg.input_data.site_url() {
                let rewritten = rewrite_loopback_site_url(site_url, "host.minikube.internal");
                cfg.input_data.set_site_url(rewritten);
            }
        }

        let mut env = env_from_input_data(&cfg.input_data);

        let mut host_network = false;
        if dev_mode {
            tracing::info!("DEV_MODE enabled, enabling host networking");
            env.push(EnvVar {
                name: "DEV_MODE".to_string(),
                value: Some("true".to_string()),
                ..Default::default()
            });
            // Use the local image when running in dev mode and host
            // networking to ease host <--> pod connectivity.
            cfg.runner = format!("{prefix}:master");
            host_network = true;
        }

        let job_id = crate::random::new_id();
        let job_name = workload_name(prefix, &job_id);

        let init_containers = if self.cfg.kubernetes.node_sysctls.is_empty() {
            None
        } else {
            tracing::info!(sysctls = %self.cfg.kubernetes.node_sysctls, "generating init containers");
            Some(gen_init_containers(
                &job_name,
                INIT_CONTAINER_IMAGE,
                &self.cfg.kubernetes.node_sysctls,
            )?)
        };

        let tolerations = job_pod_tolerations()?;

        let ttl_seconds_after_finished = if self.cfg.failed_jobs_retention_time.is_zero() {
            None
        } else {
            Some(self.cfg.failed_jobs_retention_time.as_duration().as_secs() as i32)
        };

        let mut volume = Volume {
            name: job_name.clone(),
            ..Default::default()
        };
        if self.cfg.kubernetes.persistent_volume_claim_name.is_empty() {
            volume.empty_dir = Some(EmptyDirVolumeSource::default());
        } else {
            tracing::debug!(
                name = %self.cfg.kubernetes.persistent_volume_claim_name,
                "using persistent volume claim"
            );
            volume.persistent_volume_claim = Some(PersistentVolumeClaimVolumeSource {
                claim_name: self.cfg.kubernetes.persistent_volume_claim_name.clone(),
                ..Default::default()
            });
        }

        let labels = HashMap::from([
            // A custom label to easily watch the job.
            (JOB_NAME_LABEL_KEY.to_string(), job_name.clone()),
            // The app label scopes enumeration and helps with fetching logs.
            (APP_LABEL_KEY.to_string(), APP_LABEL_VALUE.to_string()),
            (JOB_ID_LABEL_KEY.to_string(), job_id.clone()),
        ]);

        let spec = BatchJob {
            metadata: ObjectMeta {
                name: Some(job_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone().into_iter().collect()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                // One workload instance per job, never restarted on failure.
                parallelism: Some(1),
                completions: Some(1),
                backoff_limit: Some(0),
                ttl_seconds_after_finished,
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels.into_iter().collect()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        init_containers,
                        containers: vec![Container {
                            name: job_name.clone(),
                            image: Some(cfg.runner.clone()),
                            image_pull_policy: Some("IfNotPresent".to_string()),
                            volume_mounts: Some(vec![VolumeMount {
                                name: job_name.clone(),
                                mount_path: VOLUME_PATH.to_string(),
                                ..Default::default()
                            }]),
                            env: Some(env),
                            resources: self
                                .resource_requirements
                                .get(&cfg.job_type)
                                .cloned(),
                            ..Default::default()
                        }],
                        volumes: Some(vec![volume]),
                        tolerations: Some(tolerations),
                        // Any failure needs to be surfaced to the user, who
                        // should start the job again.
                        restart_policy: Some("Never".to_string()),
                        termination_grace_period_seconds: Some(STOP_TIMEOUT.as_secs() as i64),
                        // Marks the pod and job as failed without actually
                        // deleting them.
                        active_deadline_seconds: Some(cfg.max_duration_sec),
                        // Only for local testing purposes (DEV_MODE).
                        host_network: Some(host_network),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        with_timeout(
            REQUEST_TIMEOUT,
            "failed to create job",
            self.jobs_api().create(&PostParams::default(), &spec),
        )
        .await?;

        let job = Job {
            config: cfg,
            id: job_id,
            start_at: jobs::now_millis(),
            stop_at: 0,
            output_data: HashMap::new(),
        };

        tracing::info!(job_id = %job.id, job_name = %job_name, "created job");

        self.spawn_supervisor(job.clone(), job_name, on_stop);

        Ok(job)
    }

    async fn stop_job(&self, job_id: &str) -> Result<(), ExecutorError> {
        // Deleting the pod(s) gracefully makes the batch job register a
        // failure, which the supervisor observes. The job object itself stays
        // behind for retention.
        self.find_job(job_id).await?;

        let lp = ListParams::default().labels(&format!("{JOB_ID_LABEL_KEY}={job_id}"));
        with_timeout(
            STOP_TIMEOUT + REQUEST_TIMEOUT,
            "failed to delete job pods",
            self.pods_api()
                .delete_collection(&DeleteParams::default(), &lp),
        )
        .await?;

        Ok(())
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), ExecutorError> {
        let jb = self.find_job(job_id).await?;
        let name = jb.metadata.name.ok_or(ExecutorError::NotFound)?;

        // Background propagation so pods are deleted along with the job.
        with_timeout(
            REQUEST_TIMEOUT,
            "failed to delete job",
            self.jobs_api().delete(&name, &DeleteParams::background()),
        )
        .await?;

        Ok(())
    }

    async fn job_logs(
        &self,
        job_id: &str,
        _stdout: &mut (dyn std::io::Write + Send),
        stderr: &mut (dyn std::io::Write + Send),
    ) -> Result<(), ExecutorError> {
        let lp = ListParams::default().labels(&format!("{JOB_ID_LABEL_KEY}={job_id}"));
        let pods = with_timeout(
            REQUEST_TIMEOUT,
            "failed to list pods for job",
            self.pods_api().list(&lp),
        )
        .await?;

        let pod = pods
            .items
            .into_iter()
            .next()
            .ok_or_else(|| ExecutorError::Failed("no pods found".to_string()))?;
        let pod_name = pod
            .metadata
            .name
            .ok_or_else(|| ExecutorError::Failed("no pods found".to_string()))?;

        let logs = with_timeout(
            REQUEST_TIMEOUT,
            "failed to get pod logs",
            self.pods_api().logs(
                &pod_name,
                &LogParams {
                    since_seconds: Some(3600),
                    ..Default::default()
                },
            ),
        )
        .await?;

        stderr
            .write_all(logs.as_bytes())
            .map_err(|e| ExecutorError::failed("failed to copy data from stream", e))?;

        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ExecutorError> {
        Ok(())
    }
}

/// Terminal outcome of a batch job, if any: `Some(true)` on success,
/// `Some(false)` on failure, `None` while still running.
fn job_outcome(jb: &BatchJob) -> Option<bool> {
    let status = jb.status.as_ref()?;
    if status.failed.unwrap_or(0) > 0 {
        return Some(false);
    }
    if status.succeeded.unwrap_or(0) > 0 {
        return Some(true);
    }
    None
}

fn count_active_jobs(jobs: &[BatchJob]) -> usize {
    jobs.iter().filter(|jb| job_outcome(jb).is_none()).count()
}

fn env_from_input_data(data: &InputData) -> Vec<EnvVar> {
    data.0
        .iter()
        .map(|(k, v)| EnvVar {
            name: k.to_uppercase(),
            value: Some(match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            ..Default::default()
        })
        .collect()
}

fn parse_resource_requirements(
    data: &str,
) -> Result<HashMap<JobType, ResourceRequirements>, ExecutorError> {
    if data.is_empty() {
        return Ok(HashMap::new());
    }
    // YAML is a superset of JSON, so a single decoder accepts both the TOML
    // string and the env variable forms.
    serde_yaml::from_str(data)
        .map_err(|e| ExecutorError::failed("failed to parse JobsResourceRequirements", e))
}

fn default_tolerations() -> Vec<Toleration> {
    vec![Toleration {
        key: Some("utilities".to_string()),
        operator: Some("Equal".to_string()),
        value: Some("true".to_string()),
        effect: Some("NoSchedule".to_string()),
        ..Default::default()
    }]
}

fn parse_tolerations(data: &str) -> Result<Vec<Toleration>, ExecutorError> {
    serde_yaml::from_str(data)
        .map_err(|e| ExecutorError::failed("failed to unmarshal tolerations", e))
}

/// Tolerations for the job pod come from `K8S_JOB_POD_TOLERATIONS` (inline
/// JSON), `K8S_JOB_POD_TOLERATIONS_FILE` (JSON or YAML file), or default to
/// tolerating the `utilities` taint.
fn job_pod_tolerations() -> Result<Vec<Toleration>, ExecutorError> {
    if let Ok(data) = std::env::var("K8S_JOB_POD_TOLERATIONS") {
        if !data.is_empty() {
            return parse_tolerations(&data);
        }
    }

    if let Ok(path) = std::env::var("K8S_JOB_POD_TOLERATIONS_FILE") {
        if !path.is_empty() {
            let data = std::fs::read_to_string(&path)
                .map_err(|e| ExecutorError::failed(&format!("failed to open file {path}"), e))?;
            return parse_tolerations(&data);
        }
    }

    Ok(default_tolerations())
}

fn gen_init_containers(
    job_name: &str,
    image: &str,
    sysctls: &str,
) -> Result<Vec<Container>, ExecutorError> {
    if job_name.is_empty() {
        return Err(ExecutorError::InvalidConfig(
            "invalid empty jobName".to_string(),
        ));
    }
    if image.is_empty() {
        return Err(ExecutorError::InvalidConfig(
            "invalid empty image".to_string(),
        ));
    }
    if sysctls.is_empty() {
        return Err(ExecutorError::InvalidConfig(
            "invalid empty sysctls".to_string(),
        ));
    }

    Ok(sysctls
        .split(',')
        .enumerate()
        .map(|(i, ctl)| Container {
            name: format!("{job_name}-init-{i}"),
            image: Some(image.to_string()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            command: Some(vec![
                "sysctl".to_string(),
                "-w".to_string(),
                ctl.to_string(),
            ]),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect())
}
