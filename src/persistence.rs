//! Persistence layer for evaluation job records and their checkpoints.
//!
//! Records are stored either in memory or as one file per job, in JSON
//! (human-readable) or bincode (compact binary).

use crate::error::{EvalError, Result};
use crate::eval::job::{Checkpoint, CheckpointUpdate, EvaluationJob, JobPatch};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Key-value store of job records with partial-field updates.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record, replacing nothing.
    async fn create(&self, job: &EvaluationJob) -> Result<()>;

    /// Fetch a record by id.
    async fn get(&self, job_id: &str) -> Result<Option<EvaluationJob>>;

    /// Apply `patch` to the stored record and return the updated record.
    ///
    /// With `expected_version` set, the write only happens if the stored
    /// record still has that version.
    async fn update(
        &self,
        job_id: &str,
        patch: JobPatch,
        expected_version: Option<u64>,
    ) -> Result<EvaluationJob>;
}

fn check_version(job: &EvaluationJob, expected_version: Option<u64>) -> Result<()> {
    match expected_version {
        Some(expected) if expected != job.version => Err(EvalError::VersionConflict {
            job_id: job.id.clone(),
            expected,
            found: job.version,
        }),
        _ => Ok(()),
    }
}

/// Job store held in process memory.
#[derive(Default, Clone)]
pub struct MemoryJobStore {
    jobs: Arc<RwLock<HashMap<String, EvaluationJob>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &EvaluationJob) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(EvalError::JobExists(job.id.clone()));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<EvaluationJob>> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn update(
        &self,
        job_id: &str,
        patch: JobPatch,
        expected_version: Option<u64>,
    ) -> Result<EvaluationJob> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| EvalError::JobNotFound(job_id.to_string()))?;

        check_version(job, expected_version)?;

        // Patch a copy so a rejected patch leaves the record untouched.
        let mut updated = job.clone();
        updated.apply(patch)?;
        *job = updated.clone();
        Ok(updated)
    }
}

/// Save format for job records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveFormat {
    /// JSON format (human-readable, larger).
    Json,
    /// Bincode format (binary, compact).
    Bincode,
}

impl SaveFormat {
    /// Determine format from file extension.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => SaveFormat::Json,
            Some("bin") | Some("bincode") => SaveFormat::Bincode,
            _ => SaveFormat::Json, // Default to JSON
        }
    }

    fn extension(self) -> &'static str {
        match self {
            SaveFormat::Json => "json",
            SaveFormat::Bincode => "bin",
        }
    }
}

/// Save a job record to a file, replacing any previous content atomically.
pub fn save_job(job: &EvaluationJob, path: &Path) -> Result<()> {
    let format = SaveFormat::from_path(path);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| EvalError::io(parent, e))?;
        }
    }

    let data = match format {
        SaveFormat::Json => serde_json::to_string_pretty(job)
            .map_err(|e| EvalError::Serialization(e.to_string()))?
            .into_bytes(),
        SaveFormat::Bincode => {
            let config = bincode::config::standard();
            bincode::serde::encode_to_vec(job, config)
                .map_err(|e| EvalError::Serialization(e.to_string()))?
        }
    };

    // Write beside the target, then rename over it.
    let tmp_path = path.with_extension(format!("{}.tmp", format.extension()));
    fs::write(&tmp_path, &data).map_err(|e| EvalError::io(&tmp_path, e))?;
    fs::rename(&tmp_path, path).map_err(|e| EvalError::io(path, e))?;

    Ok(())
}

/// Load a job record from a file.
pub fn load_job(path: &Path) -> Result<EvaluationJob> {
    let data = fs::read(path).map_err(|e| EvalError::io(path, e))?;

    let job = match SaveFormat::from_path(path) {
        SaveFormat::Json => serde_json::from_slice(&data)
            .map_err(|e| EvalError::Serialization(e.to_string()))?,
        SaveFormat::Bincode => {
            let config = bincode::config::standard();
            let (job, _): (EvaluationJob, usize) =
                bincode::serde::decode_from_slice(&data, config)
                    .map_err(|e| EvalError::Serialization(e.to_string()))?;
            job
        }
    };

    Ok(job)
}

/// Job store keeping one file per job in a directory.
pub struct FileJobStore {
    dir: PathBuf,
    format: SaveFormat,
    /// Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FileJobStore {
    pub fn new(dir: impl Into<PathBuf>, format: SaveFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the record file for a job id.
    ///
    /// ASCII letters, digits and `-` are kept; every other byte becomes
    /// `_XX` (hex), so distinct ids never share a file.
    pub fn job_path(&self, job_id: &str) -> PathBuf {
        let mut name = String::with_capacity(job_id.len());
        for byte in job_id.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                name.push(byte as char);
            } else {
                name.push_str(&format!("_{:02x}", byte));
            }
        }
        self.dir.join(format!("{}.{}", name, self.format.extension()))
    }

    /// Load the record at `path` and check that it belongs to `job_id`.
    fn load_owned(&self, job_id: &str, path: &Path) -> Result<EvaluationJob> {
        let job = load_job(path)?;
        if job.id != job_id {
            return Err(EvalError::Serialization(format!(
                "{} holds job {}, expected {}",
                path.display(),
                job.id,
                job_id
            )));
        }
        Ok(job)
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn create(&self, job: &EvaluationJob) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.job_path(&job.id);
        if path.exists() {
            return Err(EvalError::JobExists(job.id.clone()));
        }
        save_job(job, &path)
    }

    async fn get(&self, job_id: &str) -> Result<Option<EvaluationJob>> {
        let path = self.job_path(job_id);
        if !path.exists() {
            return Ok(None);
        }
        self.load_owned(job_id, &path).map(Some)
    }

    async fn update(
        &self,
        job_id: &str,
        patch: JobPatch,
        expected_version: Option<u64>,
    ) -> Result<EvaluationJob> {
        let _guard = self.write_lock.lock().await;
        let path = self.job_path(job_id);
        if !path.exists() {
            return Err(EvalError::JobNotFound(job_id.to_string()));
        }

        let mut job = self.load_owned(job_id, &path)?;
        check_version(&job, expected_version)?;
        job.apply(patch)?;
        save_job(&job, &path)?;
        Ok(job)
    }
}

/// Reads and writes the checkpoint embedded in a job record.
#[derive(Clone)]
pub struct CheckpointStore {
    jobs: Arc<dyn JobStore>,
}

impl CheckpointStore {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }

    /// The job's checkpoint, or `None` when the job has not been suspended.
    pub async fn load(&self, job_id: &str) -> Result<Option<Checkpoint>> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| EvalError::JobNotFound(job_id.to_string()))?;
        Ok(job.checkpoint)
    }

    /// Store a checkpoint with a single field update on the job record.
    ///
    /// Returns the new record version.
    pub async fn save(
        &self,
        job_id: &str,
        checkpoint: Checkpoint,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        let job = self
            .jobs
            .update(job_id, JobPatch::checkpoint(checkpoint), expected_version)
            .await?;
        Ok(job.version)
    }

    /// Store a checkpoint together with the job's per-sample diagnostics in
    /// one update. Returns the new record version.
    pub async fn save_progress(
        &self,
        job_id: &str,
        checkpoint: Checkpoint,
        sample_errors: Vec<String>,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        let patch = JobPatch::checkpoint(checkpoint).with_sample_errors(sample_errors);
        let job = self.jobs.update(job_id, patch, expected_version).await?;
        Ok(job.version)
    }

    /// Remove the checkpoint from the job record.
    pub async fn clear(&self, job_id: &str) -> Result<()> {
        let patch = JobPatch {
            checkpoint: CheckpointUpdate::Remove,
            ..Default::default()
        };
        self.jobs.update(job_id, patch, None).await?;
        Ok(())
    }
}
