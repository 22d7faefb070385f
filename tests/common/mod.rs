//! Shared test fixtures: an in-memory executor and service state wiring.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use calls_offloader::api::{router, AppState};
use calls_offloader::auth::{AuthService, SessionCache};
use calls_offloader::config::{SecurityConfig, SessionCacheConfig};
use calls_offloader::error::ExecutorError;
use calls_offloader::executor::Executor;
use calls_offloader::jobs::{self, Job, JobConfig, JobStore, ServiceConfig, StopCb};
use calls_offloader::random;
use calls_offloader::store::Store;

pub const ADMIN_SECRET: &str = "adminsecretkey";
pub const VALID_RUNNER: &str = "mattermost/calls-recorder:v0.6.0";

pub struct MockJob {
    pub job: Job,
    pub on_stop: StopCb,
    pub stopped: bool,
}

/// In-memory executor standing in for the container back-ends.
pub struct MockExecutor {
    max_concurrent_jobs: usize,
    pub jobs: Mutex<HashMap<String, MockJob>>,
}

impl MockExecutor {
    pub fn new(max_concurrent_jobs: usize) -> Self {
        Self {
            max_concurrent_jobs,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| !j.stopped)
            .count()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.lock().unwrap().contains_key(job_id)
    }

    /// Simulate the workload reaching a terminal state: runs the stop
    /// callback the way a supervisor would.
    pub async fn finish(&self, job_id: &str, success: bool) {
        let (job, on_stop) = {
            let mut jobs = self.jobs.lock().unwrap();
            let entry = jobs.get_mut(job_id).expect("job should exist");
            entry.stopped = true;
            (entry.job.clone(), entry.on_stop.clone())
        };
        on_stop(job, success).await.expect("stop callback failed");
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn init(&self, cfg: ServiceConfig) -> Result<(), ExecutorError> {
        cfg.is_valid("mattermost")
            .map_err(|e| ExecutorError::InvalidConfig(format!("invalid service config: {e}")))
    }

    async fn create_job(&self, cfg: JobConfig, on_stop: StopCb) -> Result<Job, ExecutorError> {
        if self.active_jobs() >= self.max_concurrent_jobs {
            return Err(ExecutorError::MaxConcurrentJobs);
        }

        let job = Job {
            config: cfg,
            id: random::new_id(),
            start_at: jobs::now_millis(),
            stop_at: 0,
            output_data: HashMap::new(),
        };

        self.jobs.lock().unwrap().insert(
            job.id.clone(),
            MockJob {
                job: job.clone(),
                on_stop,
                stopped: false,
            },
        );

        Ok(job)
    }

    async fn stop_job(&self, job_id: &str) -> Result<(), ExecutorError> {
        let mut jobs = self.jobs.lock().unwrap();
        let entry = jobs.get_mut(job_id).ok_or(ExecutorError::NotFound)?;
        entry.stopped = true;
        Ok(())
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), ExecutorError> {
        self.jobs
            .lock()
            .unwrap()
            .remove(job_id)
            .map(|_| ())
            .ok_or(ExecutorError::NotFound)
    }

    async fn job_logs(
        &self,
        job_id: &str,
        _stdout: &mut (dyn std::io::Write + Send),
        stderr: &mut (dyn std::io::Write + Send),
    ) -> Result<(), ExecutorError> {
        if !self.contains(job_id) {
            return Err(ExecutorError::failed("failed to get logs", "no such job"));
        }
        stderr.write_all(b"log line\n").unwrap();
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ExecutorError> {
        Ok(())
    }
}

pub struct TestHarness {
    pub router: axum::Router,
    pub mock: Arc<MockExecutor>,
    pub job_store: JobStore,
    pub auth: Arc<AuthService>,
    pub _dir: tempfile::TempDir,
}

pub fn setup(max_concurrent_jobs: usize, allow_self_registration: bool) -> TestHarness {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join("db").to_str().unwrap()).unwrap();
    let session_cache = Arc::new(SessionCache::new(&SessionCacheConfig::default()));
    let auth = Arc::new(AuthService::new(store.clone(), session_cache));
    let job_store = JobStore::new(store);
    let mock = Arc::new(MockExecutor::new(max_concurrent_jobs));

    let state = AppState {
        security: SecurityConfig {
            enable_admin: true,
            admin_secret_key: ADMIN_SECRET.to_string(),
            allow_self_registration,
            session_cache: SessionCacheConfig::default(),
        },
        image_registry: "mattermost".to_string(),
        auth: auth.clone(),
        job_store: job_store.clone(),
        executor: mock.clone(),
    };

    TestHarness {
        router: router(state),
        mock,
        job_store,
        auth,
        _dir: dir,
    }
}
