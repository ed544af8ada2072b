//! Job record storage

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;

use crate::core::config::OrchestratorConfig;
use crate::core::error::{Result, ResultExt, TtsError};
use super::types::Job;

/// Durable key-value store of job records
pub trait JobStore: Send + Sync {
    /// Insert or overwrite a record
    fn put(&self, job: &Job) -> Result<()>;

    fn get(&self, id: &str) -> Result<Option<Job>>;

    /// All records, oldest first
    fn list(&self) -> Result<Vec<Job>>;
}

/// Process-local store
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<String, Job>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for InMemoryJobStore {
    fn put(&self, job: &Job) -> Result<()> {
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.jobs.get(id).map(|j| j.value().clone()))
    }

    fn list(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.iter().map(|j| j.value().clone()).collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}

/// One JSON file per job, replaced atomically on every write
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| TtsError::Io {
            message: format!("Failed to create job store: {}", e),
            path: Some(dir.clone()),
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn read(path: &Path) -> Result<Job> {
        let content = std::fs::read_to_string(path).map_err(|e| TtsError::Io {
            message: format!("Failed to read job record: {}", e),
            path: Some(path.to_path_buf()),
        })?;
        serde_json::from_str(&content)
            .with_context(|| format!("Malformed job record {}", path.display()))
    }
}

impl JobStore for FileJobStore {
    fn put(&self, job: &Job) -> Result<()> {
        let path = self.path_for(&job.id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(job)?;
        std::fs::write(&tmp, content)
            .and_then(|_| std::fs::rename(&tmp, &path))
            .map_err(|e| TtsError::Io {
                message: format!("Failed to write job record: {}", e),
                path: Some(path.clone()),
            })
    }

    fn get(&self, id: &str) -> Result<Option<Job>> {
        if id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(TtsError::Validation {
                message: format!("invalid job id '{}'", id),
                field: Some("job_id".to_string()),
            });
        }
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    fn list(&self) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                jobs.push(Self::read(&path)?);
            }
        }
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}

/// File store when a directory is configured, in-memory otherwise
pub fn open_store(config: &OrchestratorConfig) -> Result<Arc<dyn JobStore>> {
    Ok(match &config.job_store_dir {
        Some(dir) => Arc::new(FileJobStore::open(dir)?),
        None => Arc::new(InMemoryJobStore::new()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobRequest, JobStatus};

    fn job() -> Job {
        Job::new(&JobRequest::new("hello", "xtts"), "balanced")
    }

    #[test]
    fn test_in_memory_put_get() {
        let store = InMemoryJobStore::new();
        let mut job = job();
        store.put(&job).unwrap();

        job.start();
        store.put(&job).unwrap();
        let loaded = store.get(&job.id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Processing);
        assert_eq!(store.list().unwrap().len(), 1);
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let job = job();
        {
            let store = FileJobStore::open(dir.path()).unwrap();
            store.put(&job).unwrap();
        }
        let store = FileJobStore::open(dir.path()).unwrap();
        let loaded = store.get(&job.id).unwrap().unwrap();
        assert_eq!(loaded.requested_engine_id, "xtts");
        assert_eq!(store.list().unwrap().len(), 1);
        assert!(!dir.path().join(format!("{}.json.tmp", job.id)).exists());
    }

    #[test]
    fn test_file_store_rejects_path_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJobStore::open(dir.path()).unwrap();
        assert!(store.get("../etc/passwd").is_err());
    }

    #[test]
    fn test_file_store_reports_malformed_record() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        let store = FileJobStore::open(dir.path()).unwrap();
        let err = store.get("broken").unwrap_err();
        assert!(err.to_string().contains("Malformed job record"));
    }
}
