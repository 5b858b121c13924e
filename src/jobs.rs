//! Serial job queue for embedding-bearing work
//!
//! Every operation that calls the runtime's embedding backend (document
//! ingestion, note embedding, query embedding) goes through one worker task,
//! one job at a time, in submission order. The backend corrupts state under
//! concurrent load, so throughput is traded for correctness here.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::error::ErrorCategory;

/// Finished job records kept for inspection
const MAX_FINISHED_JOBS: usize = 256;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Job queue is shut down")]
    Closed,
    #[error("Job {0} aborted before producing a result")]
    Aborted(String),
}

impl QueueError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Internal
    }
}

/// Job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Job type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    IngestDocument,
    EmbedNote,
    EmbedQuery,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IngestDocument => write!(f, "ingest_document"),
            Self::EmbedNote => write!(f, "embed_note"),
            Self::EmbedQuery => write!(f, "embed_query"),
        }
    }
}

/// Job record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(job_type: JobType) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_type,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct QueuedJob {
    id: String,
    task: BoxedTask,
}

/// Handle to a submitted job
pub struct JobHandle<T> {
    pub id: String,
    result: oneshot::Receiver<T>,
}

impl<T> JobHandle<T> {
    /// Wait for the job to finish
    pub async fn wait(self) -> Result<T, QueueError> {
        self.result.await.map_err(|_| QueueError::Aborted(self.id))
    }
}

#[derive(Default)]
struct JobRegistry {
    jobs: HashMap<String, Job>,
    finished: std::collections::VecDeque<String>,
}

impl JobRegistry {
    fn update<F: FnOnce(&mut Job)>(&mut self, id: &str, f: F) {
        if let Some(job) = self.jobs.get_mut(id) {
            f(job);
            if job.status.is_terminal() {
                self.finished.push_back(id.to_string());
                while self.finished.len() > MAX_FINISHED_JOBS {
                    if let Some(old) = self.finished.pop_front() {
                        self.jobs.remove(&old);
                    }
                }
            }
        }
    }
}

/// Single-worker FIFO queue. Cheap to clone; clones share the worker.
#[derive(Clone)]
pub struct SerialQueue {
    tx: mpsc::UnboundedSender<QueuedJob>,
    registry: Arc<RwLock<JobRegistry>>,
    pending: Arc<AtomicUsize>,
}

impl SerialQueue {
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(RwLock::new(JobRegistry::default()));
        let pending = Arc::new(AtomicUsize::new(0));

        tokio::spawn(Self::worker_loop(rx, registry.clone(), pending.clone()));
        tracing::debug!("Serial job queue started");

        Self {
            tx,
            registry,
            pending,
        }
    }

    async fn worker_loop(
        mut rx: mpsc::UnboundedReceiver<QueuedJob>,
        registry: Arc<RwLock<JobRegistry>>,
        pending: Arc<AtomicUsize>,
    ) {
        while let Some(queued) = rx.recv().await {
            registry.write().update(&queued.id, |job| {
                job.status = JobStatus::Running;
                job.started_at = Some(Utc::now());
            });
            tracing::debug!("Job {} started", queued.id);

            // Completed jobs record their own outcome; only panics are recorded here
            if AssertUnwindSafe(queued.task).catch_unwind().await.is_err() {
                tracing::error!("Job {} panicked", queued.id);
                finish(&registry, &pending, &queued.id, Err("job panicked".to_string()));
            }
        }
        tracing::debug!("Serial job queue stopped");
    }

    /// Append a job to the queue. It starts once every earlier job has finished.
    pub fn enqueue<T, E, F>(&self, job_type: JobType, task: F) -> Result<JobHandle<Result<T, E>>, QueueError>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let job = Job::new(job_type);
        let id = job.id.clone();
        let (result_tx, result_rx) = oneshot::channel();

        let registry = self.registry.clone();
        let pending = self.pending.clone();
        let job_id = id.clone();
        let wrapped: BoxedTask = Box::pin(async move {
            let result = task.await;
            let status = result.as_ref().map(|_| ()).map_err(|e| e.to_string());
            // The record is final before the submitter sees the result
            finish(&registry, &pending, &job_id, status);
            // The submitter may have stopped waiting; the job still counts
            let _ = result_tx.send(result);
        });

        self.registry.write().jobs.insert(id.clone(), job);
        self.pending.fetch_add(1, Ordering::SeqCst);

        if self
            .tx
            .send(QueuedJob {
                id: id.clone(),
                task: wrapped,
            })
            .is_err()
        {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            self.registry.write().jobs.remove(&id);
            return Err(QueueError::Closed);
        }

        tracing::debug!("Queued {} job {}", job_type, id);
        Ok(JobHandle {
            id,
            result: result_rx,
        })
    }

    /// Enqueue and wait for the result
    pub async fn run<T, E, F>(&self, job_type: JobType, task: F) -> Result<Result<T, E>, QueueError>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        self.enqueue(job_type, task)?.wait().await
    }

    /// Snapshot of a job record
    pub fn job(&self, id: &str) -> Option<Job> {
        self.registry.read().jobs.get(id).cloned()
    }

    /// Snapshot of all known jobs, oldest first
    pub fn jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.registry.read().jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Jobs queued or running
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

fn finish(
    registry: &RwLock<JobRegistry>,
    pending: &AtomicUsize,
    id: &str,
    outcome: Result<(), String>,
) {
    registry.write().update(id, |job| {
        job.completed_at = Some(Utc::now());
        match &outcome {
            Ok(()) => job.status = JobStatus::Succeeded,
            Err(e) => {
                job.status = JobStatus::Failed;
                job.error = Some(e.clone());
            }
        }
    });
    pending.fetch_sub(1, Ordering::SeqCst);

    match outcome {
        Ok(()) => tracing::debug!("Job {} succeeded", id),
        Err(e) => tracing::debug!("Job {} failed: {}", id, e),
    }
}

impl Default for SerialQueue {
    fn default() -> Self {
        Self::new()
    }
}
