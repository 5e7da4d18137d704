//! The resumable job controller.
//!
//! An invocation evaluates samples in dataset order until the dataset is
//! exhausted or the time budget runs low. Each iteration is one call to
//! [`JobController::step`], which reports what the invocation should do
//! next; [`JobController::run_invocation`] acts on those signals, writing
//! the job record and emitting continuations.

use crate::config::EngineConfig;
use crate::error::{EvalError, Result, truncate_message};
use crate::eval::dataset::{DatasetLoader, DatasetProvider, Sample};
use crate::eval::dispatch::RequeueDispatcher;
use crate::eval::job::{
    Checkpoint, CheckpointUpdate, EvaluationJob, JobParameters, JobPatch, JobStatus,
};
use crate::eval::metrics;
use crate::eval::telemetry::{SampleEvent, SummaryEvent, TelemetrySink};
use crate::llm::{Prediction, Predictor, PredictorSource};
use crate::persistence::{CheckpointStore, JobStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Samples between progress log lines.
const PROGRESS_INTERVAL: u64 = 10;

/// Remaining execution time of the current invocation.
pub trait TimeBudget: Send + Sync {
    fn remaining(&self) -> Duration;
}

/// A budget that expires at a fixed instant.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    expires_at: Instant,
}

impl Deadline {
    pub fn at(expires_at: Instant) -> Self {
        Self { expires_at }
    }

    /// A deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self::at(Instant::now() + budget)
    }
}

impl TimeBudget for Deadline {
    fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Scores of one successfully evaluated sample.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleScore {
    pub sample_id: String,
    pub anls: f64,
    pub iou: f64,
    pub prediction: Prediction,
}

/// Why a single sample could not be scored.
///
/// These failures are counted and the loop moves on to the next sample.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SampleFailure {
    #[error("image unreadable: {0}")]
    Image(String),
    #[error("predictor failed: {0}")]
    Predictor(String),
    #[error("malformed prediction: {0}")]
    MalformedPrediction(String),
}

pub type SampleOutcome = std::result::Result<SampleScore, SampleFailure>;

/// Aggregates of a job in progress.
#[derive(Debug, Clone, PartialEq)]
pub struct RunState {
    next_index: u64,
    samples_evaluated: u64,
    samples_failed: u64,
    running_anls: f64,
    running_iou: f64,
    part: u32,
    errors: Vec<String>,
    max_errors: usize,
}

impl RunState {
    /// Restore aggregates from a checkpoint; no checkpoint means a fresh start.
    pub fn from_checkpoint(checkpoint: Option<&Checkpoint>, max_errors: usize) -> Self {
        let cp = checkpoint.cloned().unwrap_or_default();
        Self {
            next_index: cp.sample_index,
            samples_evaluated: cp.samples_evaluated,
            samples_failed: cp.samples_failed,
            running_anls: cp.running_anls,
            running_iou: cp.running_iou,
            part: cp.part,
            errors: Vec::new(),
            max_errors,
        }
    }

    /// Restore from a job record, keeping diagnostics of earlier parts.
    pub fn resume(job: &EvaluationJob, max_errors: usize) -> Self {
        let mut state = Self::from_checkpoint(job.checkpoint.as_ref(), max_errors);
        if job.checkpoint.is_some() {
            state.errors = job.sample_errors.iter().take(max_errors).cloned().collect();
        }
        state
    }

    /// Index of the next sample to evaluate.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn samples_evaluated(&self) -> u64 {
        self.samples_evaluated
    }

    pub fn samples_failed(&self) -> u64 {
        self.samples_failed
    }

    pub fn running_anls(&self) -> f64 {
        self.running_anls
    }

    pub fn running_iou(&self) -> f64 {
        self.running_iou
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Fold the outcome of the sample at `next_index` into the aggregates.
    pub fn record(&mut self, outcome: &SampleOutcome) {
        match outcome {
            Ok(score) => {
                self.samples_evaluated += 1;
                let n = self.samples_evaluated as f64;
                self.running_anls += (score.anls - self.running_anls) / n;
                self.running_iou += (score.iou - self.running_iou) / n;
            }
            Err(failure) => {
                self.samples_failed += 1;
                if self.errors.len() < self.max_errors {
                    self.errors
                        .push(format!("Sample {}: {}", self.next_index, failure));
                }
            }
        }
        self.next_index += 1;
    }

    /// Checkpoint to persist when suspending before `next_index`.
    pub fn suspend_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            sample_index: self.next_index,
            samples_evaluated: self.samples_evaluated,
            samples_failed: self.samples_failed,
            running_anls: self.running_anls,
            running_iou: self.running_iou,
            part: self.part + 1,
        }
    }

    fn summary(&self) -> JobSummary {
        JobSummary {
            avg_anls: self.running_anls,
            avg_iou: self.running_iou,
            samples_evaluated: self.samples_evaluated,
            samples_failed: self.samples_failed,
            parts: self.part + 1,
        }
    }
}

/// Final aggregates of a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub avg_anls: f64,
    pub avg_iou: f64,
    pub samples_evaluated: u64,
    pub samples_failed: u64,
    /// Invocations the job took, including the final one.
    pub parts: u32,
}

/// What the invocation should do after one step.
#[derive(Debug)]
pub enum Step {
    /// A sample was processed; keep going.
    Continue,
    /// The budget is low; persist this checkpoint and suspend.
    Checkpoint(Checkpoint),
    /// Every sample was processed.
    Done(JobSummary),
    /// The job cannot continue.
    Failed(EvalError),
}

/// Result of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationOutcome {
    /// Progress was checkpointed and a continuation enqueued.
    Suspended { checkpoint: Checkpoint },
    Completed(JobSummary),
    /// The job had already reached a terminal status.
    Skipped { status: JobStatus },
}

/// Everything an invocation needs besides the job parameters.
#[derive(Clone)]
pub struct EngineContext {
    pub jobs: Arc<dyn JobStore>,
    pub datasets: Arc<dyn DatasetLoader>,
    pub predictors: Arc<dyn PredictorSource>,
    pub dispatcher: RequeueDispatcher,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub config: EngineConfig,
}

/// One invocation's working set: the opened dataset, the predictor and the
/// running aggregates.
pub struct Run {
    params: JobParameters,
    dataset: Box<dyn DatasetProvider>,
    predictor: Arc<dyn Predictor>,
    state: RunState,
}

impl Run {
    pub fn new(
        params: JobParameters,
        dataset: Box<dyn DatasetProvider>,
        predictor: Arc<dyn Predictor>,
        state: RunState,
    ) -> Self {
        Self {
            params,
            dataset,
            predictor,
            state,
        }
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn dataset_len(&self) -> u64 {
        self.dataset.len() as u64
    }
}

/// Drives evaluation jobs through `PENDING → RUNNING → COMPLETED | FAILED`.
pub struct JobController {
    ctx: EngineContext,
    checkpoints: CheckpointStore,
}

impl JobController {
    pub fn new(ctx: EngineContext) -> Self {
        let checkpoints = CheckpointStore::new(ctx.jobs.clone());
        Self { ctx, checkpoints }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    /// Run one invocation of the job named by `params`.
    ///
    /// Redelivery to a finished job is a no-op. Errors that abort the job
    /// are persisted as `FAILED` before being returned.
    pub async fn run_invocation(
        &self,
        params: &JobParameters,
        budget: &dyn TimeBudget,
    ) -> Result<InvocationOutcome> {
        let job_id = params.evaluation_job_id.as_str();
        let job = self
            .ctx
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| EvalError::JobNotFound(job_id.to_string()))?;

        if job.status.is_terminal() {
            info!(job = %job_id, status = %job.status, "Job already finished, skipping");
            return Ok(InvocationOutcome::Skipped { status: job.status });
        }

        match self.drive(job, params, budget).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                error!(job = %job_id, error = %err, "Evaluation aborted");
                if err.marks_job_failed() {
                    self.mark_failed(job_id, &err).await;
                }
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        job: EvaluationJob,
        params: &JobParameters,
        budget: &dyn TimeBudget,
    ) -> Result<InvocationOutcome> {
        let job_id = job.id.clone();
        let running = self
            .ctx
            .jobs
            .update(&job_id, JobPatch::status(JobStatus::Running), Some(job.version))
            .await?;
        let mut version = running.version;

        let mut run = self.start(&running, params).await?;
        info!(
            job = %job_id,
            model = %params.display_name(),
            dataset = %run.dataset.name(),
            samples = run.dataset_len(),
            resume_from = run.state.next_index(),
            "Starting evaluation"
        );

        loop {
            match self.step(&mut run, budget).await {
                Step::Continue => {}
                Step::Checkpoint(checkpoint) => {
                    version = self
                        .checkpoints
                        .save_progress(
                            &job_id,
                            checkpoint.clone(),
                            run.state.errors().to_vec(),
                            Some(version),
                        )
                        .await?;
                    debug!(job = %job_id, version, "Checkpoint saved");
                    self.ctx.dispatcher.enqueue_continuation(params).await?;
                    info!(
                        job = %job_id,
                        sample_index = checkpoint.sample_index,
                        part = checkpoint.part,
                        "Suspended with checkpoint"
                    );
                    return Ok(InvocationOutcome::Suspended { checkpoint });
                }
                Step::Done(summary) => {
                    self.complete(&job_id, &summary, &run, version).await?;
                    return Ok(InvocationOutcome::Completed(summary));
                }
                Step::Failed(err) => return Err(err),
            }
        }
    }

    /// Open the dataset and predictor for a job and restore its aggregates.
    pub async fn start(&self, job: &EvaluationJob, params: &JobParameters) -> Result<Run> {
        let dataset = self.ctx.datasets.open(params).await?;
        let predictor = self.ctx.predictors.predictor_for(params)?;
        let state = RunState::resume(job, self.ctx.config.max_sample_errors);
        Ok(Run::new(params.clone(), dataset, predictor, state))
    }

    /// Advance the run by at most one sample.
    ///
    /// The budget is checked before each sample, never during a predictor
    /// call, so the reserve must cover one call's worst-case latency.
    pub async fn step(&self, run: &mut Run, budget: &dyn TimeBudget) -> Step {
        let len = run.dataset_len();
        let index = run.state.next_index();

        if index >= len {
            if run.state.samples_evaluated() == 0 && len > 0 {
                return Step::Failed(EvalError::AllSamplesFailed {
                    failed: run.state.samples_failed(),
                });
            }
            return Step::Done(run.state.summary());
        }

        if budget.remaining() < self.ctx.config.reserve() {
            return Step::Checkpoint(run.state.suspend_checkpoint());
        }

        let sample = match run.dataset.sample(index as usize).await {
            Ok(sample) => sample,
            Err(err) => return Step::Failed(err),
        };

        let outcome = self.evaluate_sample(run, &sample).await;
        run.state.record(&outcome);

        match &outcome {
            Ok(score) => self.emit_sample(run, index, &sample, score),
            Err(failure) => {
                warn!(job = %run.params.evaluation_job_id, index, error = %failure, "Sample failed");
            }
        }

        let processed = run.state.samples_evaluated() + run.state.samples_failed();
        if processed % PROGRESS_INTERVAL == 0 {
            info!(
                job = %run.params.evaluation_job_id,
                progress = %format!("{}/{}", index + 1, len),
                anls = %format!("{:.4}", run.state.running_anls()),
                iou = %format!("{:.4}", run.state.running_iou()),
                failed = run.state.samples_failed(),
                "Progress"
            );
        }

        Step::Continue
    }

    async fn evaluate_sample(&self, run: &Run, sample: &Sample) -> SampleOutcome {
        let image = run
            .dataset
            .image_bytes(sample)
            .await
            .map_err(|e| SampleFailure::Image(e.to_string()))?;

        let prediction = run
            .predictor
            .predict(&image, &sample.question, &sample.language)
            .await
            .map_err(|e| match e {
                EvalError::MalformedPrediction(msg) => SampleFailure::MalformedPrediction(msg),
                other => SampleFailure::Predictor(other.to_string()),
            })?;

        prediction.validate().map_err(|e| match e {
            EvalError::MalformedPrediction(msg) => SampleFailure::MalformedPrediction(msg),
            other => SampleFailure::MalformedPrediction(other.to_string()),
        })?;

        Ok(SampleScore {
            sample_id: sample.id.clone(),
            anls: metrics::anls(
                &prediction.answer,
                &sample.answers,
                self.ctx.config.anls_threshold,
            ),
            iou: metrics::iou(&prediction.bbox, &sample.answer_bbox),
            prediction,
        })
    }

    fn emit_sample(&self, run: &Run, index: u64, sample: &Sample, score: &SampleScore) {
        let event = SampleEvent {
            job_id: run.params.evaluation_job_id.clone(),
            model_id: run.params.model_id.clone(),
            sample_index: index,
            annotation_id: sample.id.clone(),
            question: sample.question.clone(),
            ground_truth: sample.answers.join("\n"),
            prediction: score.prediction.answer.clone(),
            anls: score.anls,
            iou: score.iou,
            samples_evaluated: run.state.samples_evaluated(),
            running_anls: run.state.running_anls(),
            running_iou: run.state.running_iou(),
        };
        if let Err(err) = self.ctx.telemetry.sample(&event) {
            warn!(job = %event.job_id, error = %err, "Telemetry sample event dropped");
        }
    }

    async fn complete(
        &self,
        job_id: &str,
        summary: &JobSummary,
        run: &Run,
        version: u64,
    ) -> Result<()> {
        let patch = JobPatch {
            status: Some(JobStatus::Completed),
            avg_anls: Some(summary.avg_anls),
            avg_iou: Some(summary.avg_iou),
            total_samples: Some(summary.samples_evaluated),
            failed_samples: Some(summary.samples_failed),
            checkpoint: CheckpointUpdate::Remove,
            sample_errors: Some(run.state.errors().to_vec()),
            error_message: None,
        };
        self.ctx.jobs.update(job_id, patch, Some(version)).await?;

        info!(
            job = %job_id,
            anls = %format!("{:.4}", summary.avg_anls),
            iou = %format!("{:.4}", summary.avg_iou),
            evaluated = summary.samples_evaluated,
            failed = summary.samples_failed,
            parts = summary.parts,
            "Evaluation completed"
        );

        let event = SummaryEvent {
            job_id: job_id.to_string(),
            model_id: run.params.model_id.clone(),
            dataset_version: run.params.dataset_version.clone(),
            avg_anls: summary.avg_anls,
            avg_iou: summary.avg_iou,
            samples_evaluated: summary.samples_evaluated,
            samples_failed: summary.samples_failed,
            parts: summary.parts,
        };
        if let Err(err) = self.ctx.telemetry.summary(&event) {
            warn!(job = %job_id, error = %err, "Telemetry summary event dropped");
        }
        Ok(())
    }

    async fn mark_failed(&self, job_id: &str, err: &EvalError) {
        let message = truncate_message(&err.to_string(), self.ctx.config.max_error_chars);
        if let Err(write_err) = self
            .ctx
            .jobs
            .update(job_id, JobPatch::failed(message), None)
            .await
        {
            warn!(job = %job_id, error = %write_err, "Could not record job failure");
        }
    }
}
