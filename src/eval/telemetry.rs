//! Optional sinks for per-sample and summary metric events.
//!
//! Sinks are observers only. The controller logs their errors and carries
//! on; job state never depends on them.

use crate::error::{EvalError, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::info;

/// Scores of one evaluated sample, plus the running means after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleEvent {
    pub job_id: String,
    pub model_id: String,
    pub sample_index: u64,
    pub annotation_id: String,
    pub question: String,
    pub ground_truth: String,
    pub prediction: String,
    pub anls: f64,
    pub iou: f64,
    pub samples_evaluated: u64,
    pub running_anls: f64,
    pub running_iou: f64,
}

/// Final aggregates of a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryEvent {
    pub job_id: String,
    pub model_id: String,
    pub dataset_version: String,
    pub avg_anls: f64,
    pub avg_iou: f64,
    pub samples_evaluated: u64,
    pub samples_failed: u64,
    pub parts: u32,
}

/// Receives metric events.
pub trait TelemetrySink: Send + Sync {
    fn sample(&self, event: &SampleEvent) -> Result<()>;
    fn summary(&self, event: &SummaryEvent) -> Result<()>;
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn sample(&self, _event: &SampleEvent) -> Result<()> {
        Ok(())
    }

    fn summary(&self, _event: &SummaryEvent) -> Result<()> {
        Ok(())
    }
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn sample(&self, event: &SampleEvent) -> Result<()> {
        tracing::debug!(
            job = %event.job_id,
            index = event.sample_index,
            anls = event.anls,
            iou = event.iou,
            "Sample scored"
        );
        Ok(())
    }

    fn summary(&self, event: &SummaryEvent) -> Result<()> {
        info!(
            job = %event.job_id,
            model = %event.model_id,
            anls = %format!("{:.4}", event.avg_anls),
            iou = %format!("{:.4}", event.avg_iou),
            evaluated = event.samples_evaluated,
            failed = event.samples_failed,
            "Evaluation summary"
        );
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum JsonlRecord<'a> {
    Sample(&'a SampleEvent),
    Summary(&'a SummaryEvent),
}

/// Appends one JSON object per event to a file.
///
/// Each line is flushed as it is written, so readers see complete events
/// while the job is still running.
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| EvalError::io(parent, e))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| EvalError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    fn write(&self, record: &JsonlRecord<'_>) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| EvalError::Serialization("telemetry file lock poisoned".to_string()))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| EvalError::io(&self.path, e))
    }
}

impl TelemetrySink for JsonlSink {
    fn sample(&self, event: &SampleEvent) -> Result<()> {
        self.write(&JsonlRecord::Sample(event))
    }

    fn summary(&self, event: &SummaryEvent) -> Result<()> {
        self.write(&JsonlRecord::Summary(event))
    }
}
