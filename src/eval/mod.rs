//! Resumable evaluation of vision-language models on document VQA datasets.
//!
//! This module provides:
//! - ANLS and IoU metrics
//! - Job records, checkpoints and the job controller state machine
//! - Dataset loading (ImageFolder exports, in-memory datasets)
//! - Continuation dispatch and telemetry sinks

pub mod dataset;
pub mod dispatch;
pub mod engine;
pub mod job;
pub mod metrics;
pub mod telemetry;

pub use dataset::{
    DatasetLoader, DatasetProvider, ImageFolderDataset, ImageFolderLoader, InMemoryDataset,
    Sample, StaticLoader,
};
pub use dispatch::{
    ContinuationChannel, MemoryChannel, RequeueDispatcher, SpoolChannel, submit_job,
};
pub use engine::{
    Deadline, EngineContext, InvocationOutcome, JobController, JobSummary, RunState,
    SampleFailure, SampleOutcome, SampleScore, Step, TimeBudget,
};
pub use job::{Checkpoint, EvaluationJob, JobParameters, JobPatch, JobStatus};
pub use metrics::{anls, iou, levenshtein_distance, normalize_bbox, single_anls, validate_bbox};
pub use telemetry::{JsonlSink, NullSink, TelemetrySink, TracingSink};
