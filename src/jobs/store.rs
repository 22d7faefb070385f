//! Job records in the KV store, serialized as JSON under a reserved prefix.

use crate::error::StoreError;
use crate::store::Store;

use super::Job;

const JOB_KEY_PREFIX: &str = "job_";

#[derive(Clone)]
pub struct JobStore {
    store: Store,
}

impl JobStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Create or overwrite the record for a job.
    pub fn save(&self, job: &Job) -> Result<(), StoreError> {
        let js =
            serde_json::to_string(job).map_err(|e| StoreError::failed("failed to marshal", e))?;
        self.store.set(&job_key(&job.id), &js)
    }

    pub fn get(&self, job_id: &str) -> Result<Job, StoreError> {
        let js = self.store.get(&job_key(job_id))?;
        serde_json::from_str(&js).map_err(|e| StoreError::failed("failed to unmarshal", e))
    }

    pub fn delete(&self, job_id: &str) -> Result<(), StoreError> {
        self.store.delete(&job_key(job_id))
    }
}

fn job_key(job_id: &str) -> String {
    format!("{JOB_KEY_PREFIX}{job_id}")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::jobs::{InputData, JobConfig, JobType};

    use super::*;

    fn test_store() -> (tempfile::TempDir, JobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("db").to_str().unwrap()).unwrap();
        (dir, JobStore::new(store))
    }

    fn test_job(id: &str) -> Job {
        Job {
            config: JobConfig {
                job_type: JobType::Recording,
                max_duration_sec: 60,
                runner: "mattermost/calls-recorder:v0.6.0".to_string(),
                input_data: InputData::default(),
            },
            id: id.to_string(),
            start_at: 1_700_000_000_000,
            stop_at: 0,
            output_data: HashMap::new(),
        }
    }

    #[test]
    fn save_get_round_trip() {
        let (_dir, store) = test_store();
        let job = test_job("abcdef123456");

        store.save(&job).unwrap();
        let loaded = store.get("abcdef123456").unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.start_at, job.start_at);
        assert_eq!(loaded.config.runner, job.config.runner);
    }

    #[test]
    fn save_overwrites() {
        let (_dir, store) = test_store();
        let mut job = test_job("abcdef123456");
        store.save(&job).unwrap();

        job.stop_at = job.start_at + 1000;
        store.save(&job).unwrap();

        let loaded = store.get("abcdef123456").unwrap();
        assert_eq!(loaded.stop_at, job.start_at + 1000);
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_dir, store) = test_store();
        assert!(matches!(
            store.get("000000000000"),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn delete_removes_record() {
        let (_dir, store) = test_store();
        let job = test_job("abcdef123456");
        store.save(&job).unwrap();
        store.delete("abcdef123456").unwrap();
        assert!(matches!(
            store.get("abcdef123456"),
            Err(StoreError::NotFound)
        ));
    }
}
