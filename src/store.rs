//! Job persistence.
//!
//! The runner saves after every transition and persists poll results with
//! [`JobStore::save_if`], so a store is the single source of truth for job
//! status.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{JobError, JobResult};
use crate::job::{Job, JobHandle, JobId, JobStatus};

/// Loads and saves job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// `None` if no record exists for `id`.
    async fn load(&self, id: &JobId) -> JobResult<Option<Job>>;

    /// Insert or replace the record for `job.id`.
    async fn save(&self, job: &Job) -> JobResult<()>;

    /// Replace the record only if it still has `expected_status` and
    /// `expected_handle`, as one atomic step. Returns `false` and writes
    /// nothing if it does not, or if there is no record.
    async fn save_if(
        &self,
        job: &Job,
        expected_status: JobStatus,
        expected_handle: Option<&JobHandle>,
    ) -> JobResult<bool>;

    /// Delete the record. Removing a missing record is not an error.
    async fn remove(&self, id: &JobId) -> JobResult<()>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<FxHashMap<JobId, Job>>,
}

fn same_attempt(stored: &Job, status: JobStatus, handle: Option<&JobHandle>) -> bool {
    stored.status == status && stored.handle.as_ref() == handle
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// No records are stored.
    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn load(&self, id: &JobId) -> JobResult<Option<Job>> {
        Ok(self.jobs.lock().await.get(id).cloned())
    }

    async fn save(&self, job: &Job) -> JobResult<()> {
        self.jobs.lock().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn save_if(
        &self,
        job: &Job,
        expected_status: JobStatus,
        expected_handle: Option<&JobHandle>,
    ) -> JobResult<bool> {
        let mut jobs = self.jobs.lock().await;
        let current = jobs
            .get(&job.id)
            .is_some_and(|stored| same_attempt(stored, expected_status, expected_handle));
        if current {
            jobs.insert(job.id.clone(), job.clone());
        }
        Ok(current)
    }

    async fn remove(&self, id: &JobId) -> JobResult<()> {
        self.jobs.lock().await.remove(id);
        Ok(())
    }
}

/// One pretty-printed `<id>.json` file per job under a directory.
///
/// Writes through one store value and its clones are serialized. Separate
/// processes sharing a directory are not coordinated.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    writes: Arc<Mutex<()>>,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writes: Arc::new(Mutex::new(())),
        }
    }

    /// Directory holding the record files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &JobId) -> JobResult<PathBuf> {
        let valid = !id.0.is_empty()
            && id
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !id.0.starts_with('.');
        if !valid {
            return Err(JobError::Persistence(format!(
                "job id '{id}' is not usable as a file name"
            )));
        }
        Ok(self.dir.join(format!("{id}.json")))
    }

    async fn read(&self, id: &JobId) -> JobResult<Option<Job>> {
        let path = self.record_path(id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(JobError::Persistence(format!(
                    "cannot read '{}': {e}",
                    path.display()
                )));
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| JobError::Persistence(format!("corrupt record '{}': {e}", path.display())))
    }

    async fn write(&self, job: &Job) -> JobResult<()> {
        let path = self.record_path(&job.id)?;
        let json = serde_json::to_vec_pretty(job)
            .map_err(|e| JobError::Persistence(format!("cannot encode job {}: {e}", job.id)))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| JobError::Persistence(format!("cannot create '{}': {e}", self.dir.display())))?;

        // Replace the record atomically.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| JobError::Persistence(format!("cannot write '{}': {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| JobError::Persistence(format!("cannot write '{}': {e}", path.display())))?;

        debug!(job = %job.id, status = %job.status, "job record saved");
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileStore {
    async fn load(&self, id: &JobId) -> JobResult<Option<Job>> {
        self.read(id).await
    }

    async fn save(&self, job: &Job) -> JobResult<()> {
        let _guard = self.writes.lock().await;
        self.write(job).await
    }

    async fn save_if(
        &self,
        job: &Job,
        expected_status: JobStatus,
        expected_handle: Option<&JobHandle>,
    ) -> JobResult<bool> {
        let _guard = self.writes.lock().await;
        match self.read(&job.id).await? {
            Some(stored) if same_attempt(&stored, expected_status, expected_handle) => {
                self.write(job).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, id: &JobId) -> JobResult<()> {
        let _guard = self.writes.lock().await;
        let path = self.record_path(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(JobError::Persistence(format!(
                "cannot remove '{}': {e}",
                path.display()
            ))),
        }
    }
}
