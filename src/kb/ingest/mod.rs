//! Ingestion pipelines for LocalRAG
//! Documents and notes become chunk vectors through the serial job queue

pub mod document;
pub mod extract;
pub mod note;

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::error::{AppError, ErrorCategory};
use crate::jobs::QueueError;
use crate::kb::embeddings::EmbeddingError;
use crate::kb::vectors::{VectorError, VectorRecord};
use crate::validation::ValidationError;
use extract::ExtractError;

pub use document::{DocumentPipeline, DocumentUpload, IngestOutcome};
pub use extract::{PlainTextExtractor, TextExtractor};
pub use note::{NoteInput, NoteOutcome, NotePipeline};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Vector(#[from] VectorError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("No text could be extracted from {0}")]
    EmptyText(String),
    #[error("Embedding model '{0}' is not available")]
    ModelUnavailable(String),
    #[error("Stored {actual} vectors for {file_id}, expected {expected}")]
    CountMismatch {
        file_id: String,
        expected: usize,
        actual: usize,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) | Self::EmptyText(_) => ErrorCategory::Validation,
            Self::Extract(e) => e.category(),
            Self::Embedding(e) => e.category(),
            Self::Vector(e) => e.category(),
            Self::Queue(e) => e.category(),
            Self::ModelUnavailable(_) => ErrorCategory::Provisioning,
            Self::CountMismatch { .. } | Self::Io(_) => ErrorCategory::Storage,
        }
    }
}

/// Where a job currently is. Serialised with a `stage` tag for event consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum IngestStage {
    Validating,
    Saving,
    Extracting,
    Chunking,
    /// `percent` is progress within the embedding stage
    Embedding { percent: f32 },
    Storing,
    Completed { chunk_count: usize },
    Failed { reason: String },
}

impl IngestStage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Saving => "saving",
            Self::Extracting => "extracting",
            Self::Chunking => "chunking",
            Self::Embedding { .. } => "embedding",
            Self::Storing => "storing",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Progress of one job
#[derive(Debug, Clone, Serialize)]
pub struct IngestProgress {
    pub job_id: String,
    pub owner_id: String,
    pub file_id: String,
    pub stage: IngestStage,
    /// Overall progress, 0-100
    pub percent: f32,
    pub message: String,
}

/// Events surfaced to the UI/CLI
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Progress(IngestProgress),
    Completed {
        job_id: String,
        owner_id: String,
        file_id: String,
        chunk_count: usize,
    },
    Failed {
        job_id: String,
        owner_id: String,
        file_id: String,
        error: AppError,
    },
}

/// Event sink shared with the job running on the queue worker
pub type ProgressCallback = Arc<dyn Fn(PipelineEvent) + Send + Sync>;

/// Callback that drops every event
pub fn ignore_events() -> ProgressCallback {
    Arc::new(|_| {})
}

/// In-memory state of one run. Records the side effects rollback must undo.
#[derive(Debug, Clone)]
pub struct IngestionJob {
    pub job_id: String,
    pub owner_id: String,
    pub file_id: String,
    pub stage: IngestStage,
    pub percent: f32,
    /// Upload written under a temporary name, not yet published
    pub staged_path: Option<PathBuf>,
    /// Set once the store has been asked to write this file's vectors
    pub storing_started: bool,
    /// Records the file had before this run, restored on rollback
    pub previous_vectors: Vec<VectorRecord>,
}

impl IngestionJob {
    pub fn new(owner_id: &str, file_id: &str) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            file_id: file_id.to_string(),
            stage: IngestStage::Validating,
            percent: 0.0,
            staged_path: None,
            storing_started: false,
            previous_vectors: Vec::new(),
        }
    }
}

/// Moves a job between stages and emits the matching events
#[derive(Clone)]
pub(crate) struct StageReporter {
    callback: ProgressCallback,
}

impl StageReporter {
    pub(crate) fn new(callback: ProgressCallback) -> Self {
        Self { callback }
    }

    pub(crate) fn advance(
        &self,
        job: &mut IngestionJob,
        stage: IngestStage,
        percent: f32,
        message: impl Into<String>,
    ) {
        let message = message.into();
        if job.stage.name() != stage.name() {
            tracing::debug!(
                "Job {} ({}) -> {}: {}",
                job.job_id,
                job.file_id,
                stage.name(),
                message
            );
        }
        job.stage = stage.clone();
        job.percent = percent;
        (self.callback)(PipelineEvent::Progress(IngestProgress {
            job_id: job.job_id.clone(),
            owner_id: job.owner_id.clone(),
            file_id: job.file_id.clone(),
            stage,
            percent,
            message,
        }));
    }

    pub(crate) fn completed(&self, job: &mut IngestionJob, chunk_count: usize) {
        self.advance(
            job,
            IngestStage::Completed { chunk_count },
            100.0,
            format!("Embedded {} chunks", chunk_count),
        );
        (self.callback)(PipelineEvent::Completed {
            job_id: job.job_id.clone(),
            owner_id: job.owner_id.clone(),
            file_id: job.file_id.clone(),
            chunk_count,
        });
    }

    pub(crate) fn failed(&self, job: &mut IngestionJob, error: &IngestError) {
        let app_error = AppError::from(error);
        let percent = job.percent;
        self.advance(
            job,
            IngestStage::Failed {
                reason: error.to_string(),
            },
            percent,
            app_error.message.clone(),
        );
        (self.callback)(PipelineEvent::Failed {
            job_id: job.job_id.clone(),
            owner_id: job.owner_id.clone(),
            file_id: job.file_id.clone(),
            error: app_error,
        });
    }
}

/// Map a `0.0..=1.0` fraction into an overall percent range
pub(crate) fn scale(fraction: f32, from: f32, to: f32) -> f32 {
    from + (to - from) * fraction.clamp(0.0, 1.0)
}
