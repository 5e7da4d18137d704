//! End-to-end behavior of the job controller: completion, per-sample
//! failures, suspension and resumption, redelivery, and interleaved writers.

use async_trait::async_trait;
use doc_vqa_eval::config::EngineConfig;
use doc_vqa_eval::error::{EvalError, Result};
use doc_vqa_eval::eval::telemetry::{SampleEvent, SummaryEvent};
use doc_vqa_eval::eval::{
    Checkpoint, ContinuationChannel, DatasetLoader, DatasetProvider, EngineContext,
    EvaluationJob, InMemoryDataset,
    InvocationOutcome, JobController, JobParameters, JobPatch, JobStatus, MemoryChannel,
    NullSink, RequeueDispatcher, Sample, SpoolChannel, StaticLoader, TelemetrySink, TimeBudget,
};
use doc_vqa_eval::llm::{Prediction, Predictor};
use doc_vqa_eval::persistence::{FileJobStore, JobStore, MemoryJobStore, SaveFormat};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

const JOB_ID: &str = "eval-0001";

#[derive(Clone, Copy)]
enum Reply {
    Answer(&'static str, [f64; 4]),
    Fail,
}

/// Answers each sample from a fixed script keyed by sample index.
struct ScriptedPredictor {
    replies: Vec<Reply>,
    calls: AtomicUsize,
}

impl ScriptedPredictor {
    fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Predictor for ScriptedPredictor {
    async fn predict(&self, image: &[u8], _question: &str, _language: &str) -> Result<Prediction> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let index: usize = String::from_utf8_lossy(image).parse().unwrap();
        match self.replies[index] {
            Reply::Answer(answer, bbox) => Ok(Prediction::new(answer, bbox)),
            Reply::Fail => Err(EvalError::PredictorApi("model throttled".to_string())),
        }
    }
}

/// Plenty of time for the first `allowed` polls, none after.
struct PollBudget {
    allowed: usize,
    polls: AtomicUsize,
}

impl PollBudget {
    fn new(allowed: usize) -> Self {
        Self {
            allowed,
            polls: AtomicUsize::new(0),
        }
    }

    fn unlimited() -> Self {
        Self::new(usize::MAX)
    }
}

impl TimeBudget for PollBudget {
    fn remaining(&self) -> Duration {
        if self.polls.fetch_add(1, Ordering::SeqCst) < self.allowed {
            Duration::from_secs(3600)
        } else {
            Duration::ZERO
        }
    }
}

struct BrokenSink;

impl TelemetrySink for BrokenSink {
    fn sample(&self, _event: &SampleEvent) -> Result<()> {
        Err(EvalError::Serialization("sink offline".to_string()))
    }

    fn summary(&self, _event: &SummaryEvent) -> Result<()> {
        Err(EvalError::Serialization("sink offline".to_string()))
    }
}

/// Fails to open any dataset with a very long message.
struct UnreachableHub;

#[async_trait]
impl DatasetLoader for UnreachableHub {
    async fn open(&self, _params: &JobParameters) -> Result<Box<dyn DatasetProvider>> {
        Err(EvalError::Dataset(format!("hub unreachable: {}", "x".repeat(5000))))
    }
}

struct BrokenChannel;

#[async_trait]
impl ContinuationChannel for BrokenChannel {
    async fn send(&self, _params: &JobParameters) -> Result<()> {
        Err(EvalError::Dispatch("queue unavailable".to_string()))
    }
}

fn params() -> JobParameters {
    JobParameters {
        evaluation_job_id: JOB_ID.to_string(),
        job_id: "batch-7".to_string(),
        dataset_version: "v1.0.0".to_string(),
        hugging_face_repo_id: "acme/receipts-vqa".to_string(),
        model_id: "vision-large".to_string(),
        model_name: Some("Vision Large".to_string()),
        predictor_model: "vision-large-2025".to_string(),
    }
}

/// One sample per ground-truth list; the image bytes carry the index.
fn dataset(truths: &[&[&str]]) -> InMemoryDataset {
    let mut dataset = InMemoryDataset::new("receipts");
    for (i, answers) in truths.iter().enumerate() {
        dataset.add_sample(
            Sample {
                id: format!("ann-{}", i),
                question: "What is the value?".to_string(),
                answers: answers.iter().map(|a| a.to_string()).collect(),
                answer_bbox: vec![0.1, 0.1, 0.5, 0.5],
                language: "en".to_string(),
                image_ref: format!("{}.png", i),
            },
            i.to_string().into_bytes(),
        );
    }
    dataset
}

struct Harness {
    jobs: Arc<dyn JobStore>,
    channel: MemoryChannel,
    predictor: Arc<ScriptedPredictor>,
    controller: JobController,
}

async fn harness_with(
    jobs: Arc<dyn JobStore>,
    truths: &[&[&str]],
    replies: Vec<Reply>,
    channel: Arc<dyn ContinuationChannel>,
    telemetry: Arc<dyn TelemetrySink>,
) -> Harness {
    let datasets = Arc::new(StaticLoader::new(dataset(truths)));
    harness_over(jobs, datasets, replies, channel, telemetry).await
}

async fn harness_over(
    jobs: Arc<dyn JobStore>,
    datasets: Arc<dyn DatasetLoader>,
    replies: Vec<Reply>,
    channel: Arc<dyn ContinuationChannel>,
    telemetry: Arc<dyn TelemetrySink>,
) -> Harness {
    jobs.create(&EvaluationJob::new(&params())).await.unwrap();
    let predictor = Arc::new(ScriptedPredictor::new(replies));
    let controller = JobController::new(EngineContext {
        jobs: jobs.clone(),
        datasets,
        predictors: Arc::new(predictor.clone()),
        dispatcher: RequeueDispatcher::new(channel),
        telemetry,
        config: EngineConfig::default(),
    });
    Harness {
        jobs,
        channel: MemoryChannel::new(),
        predictor,
        controller,
    }
}

async fn harness(truths: &[&[&str]], replies: Vec<Reply>) -> Harness {
    let channel = MemoryChannel::new();
    let mut h = harness_with(
        Arc::new(MemoryJobStore::new()),
        truths,
        replies,
        Arc::new(channel.clone()),
        Arc::new(NullSink),
    )
    .await;
    h.channel = channel;
    h
}

impl Harness {
    async fn job(&self) -> EvaluationJob {
        self.jobs.get(JOB_ID).await.unwrap().unwrap()
    }

    /// Run the first invocation, then one more per continuation message,
    /// giving every invocation `polls` budget checks.
    async fn run_to_end(&self, polls: usize) -> Vec<InvocationOutcome> {
        let mut outcomes = vec![
            self.controller
                .run_invocation(&params(), &PollBudget::new(polls))
                .await
                .unwrap(),
        ];
        while let Some(message) = self.channel.pop().await {
            outcomes.push(
                self.controller
                    .run_invocation(&message, &PollBudget::new(polls))
                    .await
                    .unwrap(),
            );
        }
        outcomes
    }
}

const BOX: [f64; 4] = [0.1, 0.1, 0.5, 0.5];

#[tokio::test]
async fn exact_answers_complete_with_perfect_scores() {
    let h = harness(
        &[&["A"], &["B"], &["C"]],
        vec![
            Reply::Answer("A", BOX),
            Reply::Answer("B", BOX),
            Reply::Answer("C", BOX),
        ],
    )
    .await;

    let outcome = h
        .controller
        .run_invocation(&params(), &PollBudget::unlimited())
        .await
        .unwrap();

    let InvocationOutcome::Completed(summary) = outcome else {
        panic!("expected completion, got {:?}", outcome);
    };
    assert_eq!(summary.avg_anls, 1.0);
    assert_eq!(summary.avg_iou, 1.0);
    assert_eq!(summary.samples_failed, 0);
    assert_eq!(summary.parts, 1);

    let job = h.job().await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.avg_anls, Some(1.0));
    assert_eq!(job.total_samples, Some(3));
    assert_eq!(job.failed_samples, Some(0));
    assert!(job.checkpoint.is_none());
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());
    assert!(h.channel.is_empty().await);
}

#[tokio::test]
async fn a_failing_sample_is_counted_and_skipped() {
    let h = harness(
        &[&["A"], &["B"], &["C"]],
        vec![Reply::Answer("A", BOX), Reply::Fail, Reply::Answer("C", BOX)],
    )
    .await;

    h.controller
        .run_invocation(&params(), &PollBudget::unlimited())
        .await
        .unwrap();

    let job = h.job().await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total_samples, Some(2));
    assert_eq!(job.failed_samples, Some(1));
    assert_eq!(job.avg_anls, Some(1.0));
    assert_eq!(job.sample_errors.len(), 1);
    assert!(job.sample_errors[0].starts_with("Sample 1:"));
    assert!(job.sample_errors[0].contains("model throttled"));
}

#[tokio::test]
async fn all_samples_failing_fails_the_job() {
    let h = harness(
        &[&["A"], &["B"], &["C"]],
        vec![Reply::Fail, Reply::Fail, Reply::Fail],
    )
    .await;

    let err = h
        .controller
        .run_invocation(&params(), &PollBudget::unlimited())
        .await
        .unwrap_err();
    assert!(matches!(err, EvalError::AllSamplesFailed { failed: 3 }));

    let job = h.job().await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(
        job.error_message
            .as_deref()
            .unwrap()
            .contains("all samples failed")
    );
    assert!(h.channel.is_empty().await);
}

#[tokio::test]
async fn dataset_load_failure_fails_the_job_with_bounded_message() {
    let channel = MemoryChannel::new();
    let h = harness_over(
        Arc::new(MemoryJobStore::new()),
        Arc::new(UnreachableHub),
        vec![],
        Arc::new(channel.clone()),
        Arc::new(NullSink),
    )
    .await;

    let err = h
        .controller
        .run_invocation(&params(), &PollBudget::unlimited())
        .await
        .unwrap_err();
    assert!(matches!(err, EvalError::Dataset(_)));

    let job = h.job().await;
    assert_eq!(job.status, JobStatus::Failed);
    let message = job.error_message.unwrap();
    assert!(message.contains("hub unreachable"));
    assert!(message.chars().count() <= EngineConfig::default().max_error_chars);
    assert_eq!(h.predictor.calls(), 0);
    assert!(channel.is_empty().await);
}

#[tokio::test]
async fn missing_image_is_a_sample_failure() {
    let mut data = dataset(&[&["A"], &["C"]]);
    data.add_question(Sample {
        id: "ann-orphan".to_string(),
        question: "What is the value?".to_string(),
        answers: vec!["B".to_string()],
        answer_bbox: BOX.to_vec(),
        language: "en".to_string(),
        image_ref: "missing.png".to_string(),
    });
    let h = harness_over(
        Arc::new(MemoryJobStore::new()),
        Arc::new(StaticLoader::new(data)),
        vec![Reply::Answer("A", BOX), Reply::Answer("C", BOX)],
        Arc::new(MemoryChannel::new()),
        Arc::new(NullSink),
    )
    .await;

    let outcome = h
        .controller
        .run_invocation(&params(), &PollBudget::unlimited())
        .await
        .unwrap();
    assert!(matches!(outcome, InvocationOutcome::Completed(_)));

    let job = h.job().await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total_samples, Some(2));
    assert_eq!(job.failed_samples, Some(1));
    assert_eq!(job.avg_anls, Some(1.0));
    assert_eq!(job.sample_errors.len(), 1);
    assert!(job.sample_errors[0].starts_with("Sample 2: image unreadable"));
    assert_eq!(h.predictor.calls(), 2);
}

#[tokio::test]
async fn low_budget_suspends_with_checkpoint_and_continuation() {
    let h = harness(
        &[&["A"], &["B"], &["C"]],
        vec![
            Reply::Answer("A", BOX),
            Reply::Answer("B", BOX),
            Reply::Answer("C", BOX),
        ],
    )
    .await;

    let outcome = h
        .controller
        .run_invocation(&params(), &PollBudget::new(1))
        .await
        .unwrap();

    let InvocationOutcome::Suspended { checkpoint } = outcome else {
        panic!("expected suspension, got {:?}", outcome);
    };
    assert_eq!(checkpoint.sample_index, 1);
    assert_eq!(checkpoint.samples_evaluated, 1);
    assert_eq!(checkpoint.part, 1);

    let job = h.job().await;
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.checkpoint, Some(checkpoint));
    assert!(job.completed_at.is_none());
    assert_eq!(h.channel.pop().await, Some(params()));
    assert_eq!(h.predictor.calls(), 1);
}

#[tokio::test]
async fn resumed_runs_match_uninterrupted_run() {
    let truths: &[&[&str]] = &[
        &["12580"],
        &["coffee", "cake", "tea"],
        &["東京都"],
        &["T-1000"],
        &["2024-03-01"],
        &["total"],
        &["yes"],
    ];
    let replies = vec![
        Reply::Answer("12580", [0.1, 0.1, 0.5, 0.5]),
        Reply::Answer("coffee\ncake", [0.0, 0.0, 0.3, 0.3]),
        Reply::Answer("東京", [0.2, 0.2, 0.4, 0.6]),
        Reply::Fail,
        Reply::Answer("2024-03-01", [0.1, 0.1, 0.5, 0.5]),
        Reply::Answer("totals", [0.3, 0.3, 0.5, 0.5]),
        Reply::Fail,
    ];

    let reference = harness(truths, replies.clone()).await;
    reference
        .controller
        .run_invocation(&params(), &PollBudget::unlimited())
        .await
        .unwrap();
    let expected = reference.job().await;

    for polls in 1..=truths.len() {
        let resumed = harness(truths, replies.clone()).await;
        let outcomes = resumed.run_to_end(polls).await;
        let job = resumed.job().await;

        assert_eq!(job.status, JobStatus::Completed, "polls={}", polls);
        assert_eq!(job.avg_anls, expected.avg_anls, "polls={}", polls);
        assert_eq!(job.avg_iou, expected.avg_iou, "polls={}", polls);
        assert_eq!(job.total_samples, expected.total_samples);
        assert_eq!(job.failed_samples, expected.failed_samples);
        assert_eq!(job.sample_errors, expected.sample_errors);
        assert!(job.checkpoint.is_none());
        assert_eq!(resumed.predictor.calls(), truths.len());

        let Some(InvocationOutcome::Completed(summary)) = outcomes.last() else {
            panic!("last invocation did not complete");
        };
        assert_eq!(summary.parts as usize, outcomes.len());
    }
}

#[tokio::test]
async fn checkpoints_advance_monotonically() {
    let h = harness(
        &[&["A"], &["B"], &["C"], &["D"], &["E"]],
        vec![
            Reply::Answer("A", BOX),
            Reply::Fail,
            Reply::Answer("C", BOX),
            Reply::Answer("x", BOX),
            Reply::Answer("E", BOX),
        ],
    )
    .await;

    let outcomes = h.run_to_end(2).await;
    let checkpoints: Vec<&Checkpoint> = outcomes
        .iter()
        .filter_map(|o| match o {
            InvocationOutcome::Suspended { checkpoint } => Some(checkpoint),
            _ => None,
        })
        .collect();

    assert_eq!(checkpoints.len(), 2);
    assert_eq!(checkpoints[0].sample_index, 2);
    assert_eq!(checkpoints[1].sample_index, 4);
    assert_eq!(checkpoints[0].part, 1);
    assert_eq!(checkpoints[1].part, 2);
    for cp in &checkpoints {
        assert!(cp.samples_evaluated + cp.samples_failed <= cp.sample_index);
    }
}

#[tokio::test]
async fn redelivery_to_finished_job_is_a_no_op() {
    let h = harness(&[&["A"]], vec![Reply::Answer("A", BOX)]).await;
    h.controller
        .run_invocation(&params(), &PollBudget::unlimited())
        .await
        .unwrap();
    let before = h.job().await;

    let outcome = h
        .controller
        .run_invocation(&params(), &PollBudget::unlimited())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        InvocationOutcome::Skipped {
            status: JobStatus::Completed
        }
    );
    assert_eq!(h.job().await, before);
    assert_eq!(h.predictor.calls(), 1);
}

#[tokio::test]
async fn redelivery_to_failed_job_is_a_no_op() {
    let h = harness(&[&["A"]], vec![Reply::Fail]).await;
    assert!(
        h.controller
            .run_invocation(&params(), &PollBudget::unlimited())
            .await
            .is_err()
    );

    let outcome = h
        .controller
        .run_invocation(&params(), &PollBudget::unlimited())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        InvocationOutcome::Skipped {
            status: JobStatus::Failed
        }
    );
    assert_eq!(h.predictor.calls(), 1);
}

/// Simulates a second invocation of the same job writing a checkpoint while
/// the first one is waiting on the predictor.
struct InterleavingPredictor {
    jobs: Arc<dyn JobStore>,
    fired: AtomicUsize,
}

#[async_trait]
impl Predictor for InterleavingPredictor {
    async fn predict(&self, _image: &[u8], _question: &str, _language: &str) -> Result<Prediction> {
        if self.fired.fetch_add(1, Ordering::SeqCst) == 0 {
            let other = Checkpoint {
                sample_index: 2,
                samples_evaluated: 2,
                samples_failed: 0,
                running_anls: 0.5,
                running_iou: 0.5,
                part: 1,
            };
            self.jobs
                .update(JOB_ID, JobPatch::checkpoint(other), None)
                .await?;
        }
        Ok(Prediction::new("A", BOX))
    }
}

#[tokio::test]
async fn concurrent_invocation_loses_to_the_newer_write() {
    let jobs: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    jobs.create(&EvaluationJob::new(&params())).await.unwrap();
    let channel = MemoryChannel::new();

    let controller = JobController::new(EngineContext {
        jobs: jobs.clone(),
        datasets: Arc::new(StaticLoader::new(dataset(&[&["A"], &["A"], &["A"]]))),
        predictors: Arc::new(Arc::new(InterleavingPredictor {
            jobs: jobs.clone(),
            fired: AtomicUsize::new(0),
        })),
        dispatcher: RequeueDispatcher::new(Arc::new(channel.clone())),
        telemetry: Arc::new(NullSink),
        config: EngineConfig::default(),
    });

    // Without the version guard the stale invocation would overwrite the
    // other writer's aggregates and count samples 0..2 twice.
    let err = controller
        .run_invocation(&params(), &PollBudget::unlimited())
        .await
        .unwrap_err();
    assert!(matches!(err, EvalError::VersionConflict { .. }));

    let job = jobs.get(JOB_ID).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.checkpoint.as_ref().map(|cp| cp.sample_index), Some(2));
    assert!(job.error_message.is_none());
    assert!(channel.is_empty().await);
}

#[tokio::test]
async fn dispatch_failure_keeps_checkpoint_and_running_status() {
    let h = harness_with(
        Arc::new(MemoryJobStore::new()),
        &[&["A"], &["B"]],
        vec![Reply::Answer("A", BOX), Reply::Answer("B", BOX)],
        Arc::new(BrokenChannel),
        Arc::new(NullSink),
    )
    .await;

    let err = h
        .controller
        .run_invocation(&params(), &PollBudget::new(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EvalError::Dispatch(_)));

    let job = h.job().await;
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.checkpoint.map(|cp| cp.sample_index), Some(1));

    // The outer retry resumes from the stored checkpoint.
    let outcome = h
        .controller
        .run_invocation(&params(), &PollBudget::unlimited())
        .await
        .unwrap();
    assert!(matches!(outcome, InvocationOutcome::Completed(_)));
    assert_eq!(h.predictor.calls(), 2);
}

#[tokio::test]
async fn telemetry_failures_do_not_affect_the_job() {
    let channel = MemoryChannel::new();
    let h = harness_with(
        Arc::new(MemoryJobStore::new()),
        &[&["A"], &["B"]],
        vec![Reply::Answer("A", BOX), Reply::Answer("B", BOX)],
        Arc::new(channel),
        Arc::new(BrokenSink),
    )
    .await;

    h.controller
        .run_invocation(&params(), &PollBudget::unlimited())
        .await
        .unwrap();
    let job = h.job().await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.avg_anls, Some(1.0));
}

#[tokio::test]
async fn file_store_and_spool_resume_across_invocations() {
    let dir = TempDir::new().unwrap();
    let spool = Arc::new(SpoolChannel::open(dir.path().join("queue")).unwrap());
    let jobs: Arc<dyn JobStore> =
        Arc::new(FileJobStore::new(dir.path().join("jobs"), SaveFormat::Json));

    let truths: &[&[&str]] = &[&["12580"], &["coffee", "cake"], &["yes"], &["T-1000"]];
    let replies = vec![
        Reply::Answer("12580", [0.1, 0.1, 0.5, 0.5]),
        Reply::Answer("coffee", [0.0, 0.0, 0.25, 0.4]),
        Reply::Fail,
        Reply::Answer("T-100", [0.15, 0.1, 0.5, 0.45]),
    ];

    let reference = harness(truths, replies.clone()).await;
    reference
        .controller
        .run_invocation(&params(), &PollBudget::unlimited())
        .await
        .unwrap();
    let expected = reference.job().await;

    let h = harness_with(
        jobs,
        truths,
        replies,
        spool.clone(),
        Arc::new(NullSink),
    )
    .await;
    spool.send(&params()).await.unwrap();

    let mut invocations = 0;
    while let Some(message) = spool.receive().unwrap() {
        h.controller
            .run_invocation(&message.params, &PollBudget::new(1))
            .await
            .unwrap();
        spool.ack(message).unwrap();
        invocations += 1;
    }

    let job = h.job().await;
    assert_eq!(invocations, 4);
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.avg_anls, expected.avg_anls);
    assert_eq!(job.avg_iou, expected.avg_iou);
    assert_eq!(job.failed_samples, Some(1));
    assert!(job.checkpoint.is_none());
}
