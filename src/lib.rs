//! Doc VQA Eval - resumable evaluation of vision-language models on
//! document visual question answering datasets.
//!
//! Each sample is scored twice: ANLS for the answer text and IoU for the
//! box where the model located it. Jobs run under a time budget per
//! invocation; when the budget runs low the controller checkpoints the
//! running aggregates into the job record, enqueues a continuation, and a
//! later invocation resumes from the next unprocessed sample.
//!
//! # Quick Start
//!
//! ```no_run
//! use doc_vqa_eval::{
//!     config::Config,
//!     eval::{
//!         Deadline, EngineContext, EvaluationJob, ImageFolderLoader, JobController,
//!         RequeueDispatcher, SpoolChannel, TracingSink,
//!     },
//!     llm::LlmClient,
//!     persistence::{FileJobStore, JobStore, SaveFormat},
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     config.validate()?;
//!
//!     let jobs = Arc::new(FileJobStore::new(&config.storage.jobs_dir, SaveFormat::Json));
//!     let queue = Arc::new(SpoolChannel::open(&config.storage.queue_dir)?);
//!
//!     let controller = JobController::new(EngineContext {
//!         jobs: jobs.clone(),
//!         datasets: Arc::new(ImageFolderLoader::new(&config.storage.datasets_dir)),
//!         predictors: Arc::new(LlmClient::new(config.predictor.clone())?),
//!         dispatcher: RequeueDispatcher::new(queue.clone()),
//!         telemetry: Arc::new(TracingSink),
//!         config: config.engine.clone(),
//!     });
//!
//!     while let Some(message) = queue.receive()? {
//!         let budget = Deadline::after(config.engine.time_budget());
//!         let outcome = controller.run_invocation(&message.params, &budget).await?;
//!         println!("{:?}", outcome);
//!         queue.ack(message)?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **metrics**: ANLS, IoU and bounding-box helpers
//! - **JobController**: the per-invocation state machine
//! - **CheckpointStore**: checkpoint reads and writes on the job record
//! - **RequeueDispatcher**: continuation messages for suspended jobs
//! - **LlmClient**: OpenAI-compatible vision predictor

pub mod config;
pub mod error;
pub mod eval;
pub mod llm;
pub mod persistence;

// Re-export commonly used types
pub use config::Config;
pub use error::{EvalError, Result};
pub use eval::{EvaluationJob, InvocationOutcome, JobController, JobParameters, JobStatus};
pub use llm::LlmClient;
pub use persistence::{CheckpointStore, FileJobStore, JobStore, MemoryJobStore};
