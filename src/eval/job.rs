//! Evaluation job records, checkpoints and continuation messages.

use crate::error::{EvalError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of an evaluation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Completed and failed jobs accept no further writes.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Partial progress of an unfinished job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    /// Index of the next sample to evaluate.
    pub sample_index: u64,
    pub samples_evaluated: u64,
    pub samples_failed: u64,
    pub running_anls: f64,
    pub running_iou: f64,
    /// Number of suspensions so far.
    pub part: u32,
}

/// Parameters of one evaluation run, as carried by queue messages.
///
/// Every continuation repeats the parameters of the first invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobParameters {
    pub evaluation_job_id: String,
    /// Batch the evaluation belongs to (one batch spans several models).
    pub job_id: String,
    pub dataset_version: String,
    pub hugging_face_repo_id: String,
    pub model_id: String,
    #[serde(default)]
    pub model_name: Option<String>,
    /// Model identifier sent to the predictor API.
    #[serde(alias = "modelBedrockId")]
    pub predictor_model: String,
}

impl JobParameters {
    pub fn display_name(&self) -> &str {
        self.model_name.as_deref().unwrap_or(&self.model_id)
    }
}

/// A job's record in the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationJob {
    pub id: String,
    pub job_id: String,
    pub model_id: String,
    pub model_name: Option<String>,
    pub predictor_model: String,
    pub dataset_version: String,
    pub hugging_face_repo_id: String,
    pub status: JobStatus,
    pub avg_anls: Option<f64>,
    pub avg_iou: Option<f64>,
    /// Samples scored successfully.
    pub total_samples: Option<u64>,
    pub failed_samples: Option<u64>,
    pub checkpoint: Option<Checkpoint>,
    /// First per-sample errors, bounded by the engine configuration.
    #[serde(default)]
    pub sample_errors: Vec<String>,
    pub error_message: Option<String>,
    /// Incremented by every write; used for optimistic concurrency.
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl EvaluationJob {
    /// Create a pending job for the given parameters.
    pub fn new(params: &JobParameters) -> Self {
        let now = Utc::now();
        Self {
            id: params.evaluation_job_id.clone(),
            job_id: params.job_id.clone(),
            model_id: params.model_id.clone(),
            model_name: params.model_name.clone(),
            predictor_model: params.predictor_model.clone(),
            dataset_version: params.dataset_version.clone(),
            hugging_face_repo_id: params.hugging_face_repo_id.clone(),
            status: JobStatus::Pending,
            avg_anls: None,
            avg_iou: None,
            total_samples: None,
            failed_samples: None,
            checkpoint: None,
            sample_errors: Vec::new(),
            error_message: None,
            version: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// The parameters that (re)start this job.
    pub fn parameters(&self) -> JobParameters {
        JobParameters {
            evaluation_job_id: self.id.clone(),
            job_id: self.job_id.clone(),
            dataset_version: self.dataset_version.clone(),
            hugging_face_repo_id: self.hugging_face_repo_id.clone(),
            model_id: self.model_id.clone(),
            model_name: self.model_name.clone(),
            predictor_model: self.predictor_model.clone(),
        }
    }

    /// Apply a partial update, bumping the version.
    ///
    /// Terminal jobs reject every patch.
    pub fn apply(&mut self, patch: JobPatch) -> Result<()> {
        if self.status.is_terminal() {
            return Err(EvalError::TerminalJob {
                job_id: self.id.clone(),
                status: self.status,
            });
        }

        let now = Utc::now();

        if let Some(status) = patch.status {
            self.status = status;
            if status == JobStatus::Running && self.started_at.is_none() {
                self.started_at = Some(now);
            }
            if status.is_terminal() {
                self.completed_at = Some(now);
            }
        }
        if let Some(value) = patch.avg_anls {
            self.avg_anls = Some(value);
        }
        if let Some(value) = patch.avg_iou {
            self.avg_iou = Some(value);
        }
        if let Some(value) = patch.total_samples {
            self.total_samples = Some(value);
        }
        if let Some(value) = patch.failed_samples {
            self.failed_samples = Some(value);
        }
        match patch.checkpoint {
            CheckpointUpdate::Keep => {}
            CheckpointUpdate::Set(checkpoint) => self.checkpoint = Some(checkpoint),
            CheckpointUpdate::Remove => self.checkpoint = None,
        }
        if let Some(errors) = patch.sample_errors {
            self.sample_errors = errors;
        }
        if let Some(message) = patch.error_message {
            self.error_message = Some(message);
        }

        self.version += 1;
        self.updated_at = now;
        Ok(())
    }
}

/// What a patch does to the embedded checkpoint.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CheckpointUpdate {
    #[default]
    Keep,
    Set(Checkpoint),
    Remove,
}

/// A partial-field update of a job record. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub avg_anls: Option<f64>,
    pub avg_iou: Option<f64>,
    pub total_samples: Option<u64>,
    pub failed_samples: Option<u64>,
    pub checkpoint: CheckpointUpdate,
    pub sample_errors: Option<Vec<String>>,
    pub error_message: Option<String>,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn checkpoint(checkpoint: Checkpoint) -> Self {
        Self {
            checkpoint: CheckpointUpdate::Set(checkpoint),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_sample_errors(mut self, errors: Vec<String>) -> Self {
        self.sample_errors = Some(errors);
        self
    }
}
