//! Doc VQA Eval CLI
//!
//! Submits evaluation jobs, runs the queue worker and inspects results.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use doc_vqa_eval::{
    config::Config,
    error::EvalError,
    eval::{
        Deadline, EngineContext, ImageFolderLoader, InvocationOutcome, JobController,
        JobParameters, JsonlSink, RequeueDispatcher, SpoolChannel, TelemetrySink, TracingSink,
        anls, iou, metrics::FULL_IMAGE_BBOX, submit_job,
    },
    llm::LlmClient,
    persistence::{FileJobStore, JobStore, SaveFormat},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Doc VQA Eval - resumable ANLS/IoU evaluation of vision-language models
#[derive(Parser)]
#[command(name = "vqa-eval")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a config file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a pending job and queue its first invocation
    Submit {
        /// Dataset repository id, e.g. "acme/receipts-vqa"
        #[arg(long)]
        repo: String,

        /// Dataset version tag
        #[arg(long, default_value = "v1.0.0")]
        dataset_version: String,

        /// Model identifier recorded on the job
        #[arg(long)]
        model_id: String,

        /// Human-readable model name
        #[arg(long)]
        model_name: Option<String>,

        /// Model name sent to the predictor API (defaults to the model id)
        #[arg(long)]
        predictor_model: Option<String>,

        /// Batch the job belongs to
        #[arg(long)]
        batch_id: Option<String>,

        /// Explicit job id (a UUID is generated otherwise)
        #[arg(long)]
        job_id: Option<String>,
    },

    /// Process queued invocations
    Worker {
        /// Exit once the queue is empty instead of polling
        #[arg(long)]
        once: bool,

        /// Seconds between polls of an empty queue
        #[arg(long, default_value_t = 5)]
        poll_secs: u64,
    },

    /// Show a job record
    Status {
        /// The evaluation job id
        job_id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Score a prediction against ground truth
    Score {
        /// Predicted answer (list items separated by newlines)
        #[arg(short, long)]
        prediction: String,

        /// Ground-truth answer; repeat for list answers
        #[arg(short, long = "truth", required = true)]
        truths: Vec<String>,

        /// Predicted box as x0,y0,x1,y1
        #[arg(long, value_delimiter = ',')]
        pred_bbox: Vec<f64>,

        /// Ground-truth box as x0,y0,x1,y1
        #[arg(long, value_delimiter = ',')]
        gt_bbox: Vec<f64>,

        /// ANLS threshold
        #[arg(long, default_value_t = 0.5)]
        threshold: f64,
    },

    /// Test predictor connection
    Test,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "doc_vqa_eval=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Submit {
            repo,
            dataset_version,
            model_id,
            model_name,
            predictor_model,
            batch_id,
            job_id,
        } => {
            let params = JobParameters {
                evaluation_job_id: job_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                job_id: batch_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                dataset_version,
                hugging_face_repo_id: repo,
                predictor_model: predictor_model.unwrap_or_else(|| model_id.clone()),
                model_id,
                model_name,
            };
            cmd_submit(cli.config, params).await
        }
        Commands::Worker { once, poll_secs } => cmd_worker(cli.config, once, poll_secs).await,
        Commands::Status { job_id, json } => cmd_status(cli.config, job_id, json).await,
        Commands::Score {
            prediction,
            truths,
            pred_bbox,
            gt_bbox,
            threshold,
        } => cmd_score(prediction, truths, pred_bbox, gt_bbox, threshold),
        Commands::Test => cmd_test(cli.config).await,
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            let mut config = Config::load_from_file(&path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?;
            config.apply_env();
            Ok(config)
        }
        None => Config::load().context("Failed to load configuration"),
    }
}

fn job_store(config: &Config) -> FileJobStore {
    FileJobStore::new(&config.storage.jobs_dir, SaveFormat::Json)
}

async fn cmd_submit(config_path: Option<PathBuf>, params: JobParameters) -> Result<()> {
    let config = load_config(config_path)?;
    config.validate_engine().context("Invalid configuration")?;

    let jobs = job_store(&config);
    let queue = SpoolChannel::open(&config.storage.queue_dir).context("Failed to open queue")?;
    submit_job(&jobs, &queue, &params)
        .await
        .with_context(|| format!("Failed to submit job {}", params.evaluation_job_id))?;

    println!("{}", params.evaluation_job_id);
    Ok(())
}

async fn cmd_worker(config_path: Option<PathBuf>, once: bool, poll_secs: u64) -> Result<()> {
    let config = load_config(config_path)?;
    config.validate().context("Invalid configuration")?;

    let queue = Arc::new(
        SpoolChannel::open(&config.storage.queue_dir).context("Failed to open queue")?,
    );
    let recovered = queue.recover_inflight()?;
    if recovered > 0 {
        warn!(recovered, "Requeued messages left in flight by a previous worker");
    }

    let telemetry: Arc<dyn TelemetrySink> = match &config.storage.telemetry_path {
        Some(path) => Arc::new(JsonlSink::open(path).context("Failed to open telemetry file")?),
        None => Arc::new(TracingSink),
    };

    let controller = JobController::new(EngineContext {
        jobs: Arc::new(job_store(&config)),
        datasets: Arc::new(ImageFolderLoader::new(&config.storage.datasets_dir)),
        predictors: Arc::new(LlmClient::new(config.predictor.clone())?),
        dispatcher: RequeueDispatcher::new(queue.clone()),
        telemetry,
        config: config.engine.clone(),
    });

    info!(queue = %queue.dir().display(), "Worker started");

    loop {
        let Some(message) = queue.receive()? else {
            if once {
                info!("Queue empty, exiting");
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(poll_secs)).await;
            continue;
        };

        let budget = Deadline::after(config.engine.time_budget());
        match controller.run_invocation(&message.params, &budget).await {
            Ok(outcome) => {
                match &outcome {
                    InvocationOutcome::Completed(summary) => println!(
                        "{}: COMPLETED anls={:.4} iou={:.4} evaluated={} failed={}",
                        message.params.evaluation_job_id,
                        summary.avg_anls,
                        summary.avg_iou,
                        summary.samples_evaluated,
                        summary.samples_failed
                    ),
                    InvocationOutcome::Suspended { checkpoint } => println!(
                        "{}: suspended at sample {} (part {})",
                        message.params.evaluation_job_id, checkpoint.sample_index, checkpoint.part
                    ),
                    InvocationOutcome::Skipped { status } => println!(
                        "{}: already {}",
                        message.params.evaluation_job_id, status
                    ),
                }
                queue.ack(message)?;
            }
            Err(EvalError::JobNotFound(id)) => {
                warn!(job = %id, "Dropping message for unknown job");
                queue.ack(message)?;
            }
            Err(err) => {
                warn!(job = %message.params.evaluation_job_id, error = %err, "Invocation failed, message returned to queue");
                queue.nack(message)?;
            }
        }
    }
}

async fn cmd_status(config_path: Option<PathBuf>, job_id: String, json: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let jobs = job_store(&config);

    let Some(job) = jobs.get(&job_id).await? else {
        anyhow::bail!("Job '{}' not found in {}", job_id, config.storage.jobs_dir.display());
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&job).context("Failed to serialize job")?
        );
        return Ok(());
    }

    println!("Evaluation Job");
    println!("{}", "─".repeat(40));
    println!("  Id:           {}", job.id);
    println!(
        "  Model:        {}",
        job.model_name.as_deref().unwrap_or(&job.model_id)
    );
    println!(
        "  Dataset:      {}@{}",
        job.hugging_face_repo_id, job.dataset_version
    );
    println!("  Status:       {}", job.status);
    if let Some(value) = job.avg_anls {
        println!("  ANLS:         {:.4}", value);
    }
    if let Some(value) = job.avg_iou {
        println!("  IoU:          {:.4}", value);
    }
    if let Some(value) = job.total_samples {
        println!("  Evaluated:    {}", value);
    }
    if let Some(value) = job.failed_samples {
        println!("  Failed:       {}", value);
    }
    if let Some(cp) = &job.checkpoint {
        println!(
            "  Checkpoint:   sample {} (part {}, {} evaluated, {} failed)",
            cp.sample_index, cp.part, cp.samples_evaluated, cp.samples_failed
        );
    }
    if let Some(message) = &job.error_message {
        println!("  Error:        {}", message);
    }
    for error in &job.sample_errors {
        println!("    - {}", error);
    }

    Ok(())
}

fn cmd_score(
    prediction: String,
    truths: Vec<String>,
    pred_bbox: Vec<f64>,
    gt_bbox: Vec<f64>,
    threshold: f64,
) -> Result<()> {
    let pred_bbox = if pred_bbox.is_empty() {
        FULL_IMAGE_BBOX.to_vec()
    } else {
        pred_bbox
    };
    let gt_bbox = if gt_bbox.is_empty() {
        FULL_IMAGE_BBOX.to_vec()
    } else {
        gt_bbox
    };

    println!("ANLS: {:.4}", anls(&prediction, &truths, threshold));
    println!("IoU:  {:.4}", iou(&pred_bbox, &gt_bbox));
    Ok(())
}

async fn cmd_test(config_path: Option<PathBuf>) -> Result<()> {
    println!("Testing predictor connection...\n");

    let config = load_config(config_path)?;

    println!("Configuration:");
    println!("  API Base:  {}", config.predictor.api_base);
    println!("  Model:     {}", config.predictor.model);
    println!(
        "  API Key:   {}...",
        config.predictor.api_key.chars().take(8).collect::<String>()
    );
    println!();

    if let Err(e) = config.validate() {
        println!("Configuration error: {}", e);
        return Ok(());
    }

    let client = LlmClient::new(config.predictor)?;

    println!("Sending test request...");
    match client.test_connection().await {
        Ok(()) => println!("Connection successful!"),
        Err(e) => println!("Connection failed: {}", e),
    }

    Ok(())
}
