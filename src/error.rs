//! Error types for the evaluation engine.

use crate::eval::job::JobStatus;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using our custom error.
pub type Result<T> = std::result::Result<T, EvalError>;

/// Default upper bound on persisted error text, in characters.
pub const DEFAULT_MAX_ERROR_CHARS: usize = 1000;

/// Errors that can occur while evaluating a job.
#[derive(Error, Debug)]
pub enum EvalError {
    /// Error reading or writing files.
    #[error("I/O error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error during serialization/deserialization.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP request error.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Predictor API error.
    #[error("Predictor API error: {0}")]
    PredictorApi(String),

    /// The predictor answered with something that is not a usable prediction.
    #[error("Malformed prediction: {0}")]
    MalformedPrediction(String),

    /// The dataset could not be opened or read.
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// A sample index outside the dataset was requested.
    #[error("Sample {index} not found (dataset has {len} samples)")]
    SampleNotFound { index: usize, len: usize },

    /// A sample image could not be read.
    #[error("Failed to read image '{path}': {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A job record with the id already exists.
    #[error("Evaluation job '{0}' already exists")]
    JobExists(String),

    /// No job record exists for the id.
    #[error("Evaluation job '{0}' not found")]
    JobNotFound(String),

    /// A job that already reached a terminal status was asked to change.
    #[error("Evaluation job '{job_id}' is already {status}")]
    TerminalJob { job_id: String, status: JobStatus },

    /// The job record changed underneath a guarded write.
    #[error("Version conflict on job '{job_id}': expected {expected}, found {found}")]
    VersionConflict {
        job_id: String,
        expected: u64,
        found: u64,
    },

    /// Every sample of a non-empty dataset failed.
    #[error("Evaluation failed: all samples failed ({failed} errors)")]
    AllSamplesFailed { failed: u64 },

    /// The continuation message could not be sent.
    #[error("Failed to enqueue continuation: {0}")]
    Dispatch(String),
}

impl EvalError {
    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether an error escaping an invocation should be persisted as a
    /// `FAILED` job status.
    ///
    /// Version conflicts mean another invocation owns the record, and a
    /// failed dispatch happens after the checkpoint is safely stored, so the
    /// redelivered message can still resume the job.
    pub fn marks_job_failed(&self) -> bool {
        !matches!(
            self,
            EvalError::VersionConflict { .. }
                | EvalError::Dispatch(_)
                | EvalError::TerminalJob { .. }
                | EvalError::JobNotFound(_)
        )
    }
}

impl From<reqwest::Error> for EvalError {
    fn from(err: reqwest::Error) -> Self {
        EvalError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for EvalError {
    fn from(err: serde_json::Error) -> Self {
        EvalError::Serialization(err.to_string())
    }
}

/// Truncate a message to at most `limit` characters.
pub fn truncate_message(message: &str, limit: usize) -> String {
    match message.char_indices().nth(limit) {
        Some((end, _)) => message[..end].to_string(),
        None => message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_message_counts_characters() {
        assert_eq!(truncate_message("hello", 10), "hello");
        assert_eq!(truncate_message("hello", 3), "hel");
        assert_eq!(truncate_message("東京都庁", 2), "東京");
        assert_eq!(truncate_message("", 0), "");
    }

    #[test]
    fn test_all_samples_failed_message() {
        let err = EvalError::AllSamplesFailed { failed: 3 };
        assert!(err.to_string().contains("all samples failed"));
    }

    #[test]
    fn test_marks_job_failed() {
        assert!(EvalError::Dataset("gone".to_string()).marks_job_failed());
        assert!(EvalError::AllSamplesFailed { failed: 1 }.marks_job_failed());
        assert!(!EvalError::Dispatch("queue down".to_string()).marks_job_failed());
        assert!(
            !EvalError::VersionConflict {
                job_id: "j".to_string(),
                expected: 1,
                found: 2,
            }
            .marks_job_failed()
        );
    }
}
