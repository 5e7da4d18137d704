//! Continuation messages for suspended jobs.
//!
//! A suspended job is resumed by sending its original parameters back to the
//! work queue. Delivery is at-least-once: a message may arrive twice, and
//! the controller treats redelivery to a finished job as a no-op.

use crate::error::{DEFAULT_MAX_ERROR_CHARS, EvalError, Result, truncate_message};
use crate::eval::job::{EvaluationJob, JobParameters, JobPatch};
use crate::persistence::JobStore;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// At-least-once channel carrying job parameters to the next invocation.
#[async_trait]
pub trait ContinuationChannel: Send + Sync {
    async fn send(&self, params: &JobParameters) -> Result<()>;
}

/// Emits continuation messages when the controller suspends a job.
#[derive(Clone)]
pub struct RequeueDispatcher {
    channel: Arc<dyn ContinuationChannel>,
}

impl RequeueDispatcher {
    pub fn new(channel: Arc<dyn ContinuationChannel>) -> Self {
        Self { channel }
    }

    /// Send the job's parameters back to the queue, unchanged.
    pub async fn enqueue_continuation(&self, params: &JobParameters) -> Result<()> {
        self.channel.send(params).await.map_err(|e| match e {
            EvalError::Dispatch(_) => e,
            other => EvalError::Dispatch(other.to_string()),
        })?;
        info!(
            job = %params.evaluation_job_id,
            model = %params.model_id,
            "Continuation enqueued"
        );
        Ok(())
    }
}

/// Create a `PENDING` record for a new job and send its first message.
///
/// The record is written first so a worker never receives a message for an
/// unknown job. If the send fails the record is marked `FAILED` with the
/// dispatch error, and that error is returned.
pub async fn submit_job(
    jobs: &dyn JobStore,
    channel: &dyn ContinuationChannel,
    params: &JobParameters,
) -> Result<EvaluationJob> {
    let job = EvaluationJob::new(params);
    jobs.create(&job).await?;

    if let Err(err) = channel.send(params).await {
        let err = match err {
            EvalError::Dispatch(_) => err,
            other => EvalError::Dispatch(other.to_string()),
        };
        let message = truncate_message(
            &format!("Submission failed: {}", err),
            DEFAULT_MAX_ERROR_CHARS,
        );
        if let Err(write_err) = jobs
            .update(&params.evaluation_job_id, JobPatch::failed(message), Some(job.version))
            .await
        {
            warn!(
                job = %params.evaluation_job_id,
                error = %write_err,
                "Could not mark unsent job as failed"
            );
        }
        return Err(err);
    }

    info!(job = %params.evaluation_job_id, model = %params.model_id, "Job submitted");
    Ok(job)
}

/// Channel that keeps messages in memory.
#[derive(Default, Clone)]
pub struct MemoryChannel {
    messages: Arc<Mutex<VecDeque<JobParameters>>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the oldest message.
    pub async fn pop(&self) -> Option<JobParameters> {
        self.messages.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }
}

#[async_trait]
impl ContinuationChannel for MemoryChannel {
    async fn send(&self, params: &JobParameters) -> Result<()> {
        self.messages.lock().await.push_back(params.clone());
        Ok(())
    }
}

/// A message claimed from the spool; ack or nack it after processing.
#[derive(Debug)]
pub struct SpooledMessage {
    pub params: JobParameters,
    path: PathBuf,
}

const MESSAGE_EXT: &str = "json";
const INFLIGHT_EXT: &str = "inflight";
const REJECTED_EXT: &str = "rejected";

/// Directory-backed queue.
///
/// Each message is one JSON file named so that lexical order is send order.
/// Receiving renames the file to `.inflight`; an ack deletes it and a nack
/// renames it back, so unacknowledged messages are delivered again.
pub struct SpoolChannel {
    dir: PathBuf,
    sequence: AtomicU64,
}

impl SpoolChannel {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| EvalError::io(&dir, e))?;
        Ok(Self {
            dir,
            sequence: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn pending(&self) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| EvalError::io(&self.dir, e))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(MESSAGE_EXT))
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Number of messages waiting for delivery.
    pub fn depth(&self) -> Result<usize> {
        Ok(self.pending()?.len())
    }

    /// Claim the oldest pending message.
    ///
    /// Messages that do not parse are moved aside as `.rejected` and
    /// skipped.
    pub fn receive(&self) -> Result<Option<SpooledMessage>> {
        for path in self.pending()? {
            let inflight = path.with_extension(INFLIGHT_EXT);
            // Another worker may have claimed it first.
            if fs::rename(&path, &inflight).is_err() {
                continue;
            }
            let body = fs::read_to_string(&inflight).map_err(|e| EvalError::io(&inflight, e))?;
            match serde_json::from_str::<JobParameters>(&body) {
                Ok(params) => {
                    return Ok(Some(SpooledMessage {
                        params,
                        path: inflight,
                    }));
                }
                Err(err) => {
                    let rejected = inflight.with_extension(REJECTED_EXT);
                    fs::rename(&inflight, &rejected).map_err(|e| EvalError::io(&rejected, e))?;
                    warn!(path = %rejected.display(), error = %err, "Rejected unreadable message");
                }
            }
        }
        Ok(None)
    }

    /// Processing succeeded; drop the message.
    pub fn ack(&self, message: SpooledMessage) -> Result<()> {
        fs::remove_file(&message.path).map_err(|e| EvalError::io(&message.path, e))
    }

    /// Processing failed; make the message deliverable again.
    pub fn nack(&self, message: SpooledMessage) -> Result<()> {
        let pending = message.path.with_extension(MESSAGE_EXT);
        fs::rename(&message.path, &pending).map_err(|e| EvalError::io(&pending, e))
    }

    /// Return messages left in flight by a crashed worker to the queue.
    pub fn recover_inflight(&self) -> Result<usize> {
        let entries = fs::read_dir(&self.dir).map_err(|e| EvalError::io(&self.dir, e))?;
        let mut recovered = 0;
        for path in entries.filter_map(|entry| entry.ok().map(|e| e.path())) {
            if path.extension().and_then(|e| e.to_str()) == Some(INFLIGHT_EXT) {
                let pending = path.with_extension(MESSAGE_EXT);
                fs::rename(&path, &pending).map_err(|e| EvalError::io(&pending, e))?;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}

#[async_trait]
impl ContinuationChannel for SpoolChannel {
    async fn send(&self, params: &JobParameters) -> Result<()> {
        let body = serde_json::to_string_pretty(params)?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        let name = format!(
            "{}-{:06}-{}",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%6f"),
            seq,
            uuid::Uuid::new_v4().simple()
        );

        // Write under a temporary name so receivers never see a partial file.
        let tmp = self.dir.join(format!("{}.tmp", name));
        let path = self.dir.join(format!("{}.{}", name, MESSAGE_EXT));
        fs::write(&tmp, body).map_err(|e| EvalError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| EvalError::io(&path, e))?;

        debug!(path = %path.display(), "Spooled message");
        Ok(())
    }
}
