//! Document ingestion pipeline
//! validate -> save -> extract -> chunk -> embed -> store, undone on failure

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use super::extract::TextExtractor;
use super::{scale, IngestError, IngestStage, IngestionJob, ProgressCallback, StageReporter};
use crate::config::{IngestConfig, RagConfig};
use crate::jobs::{JobType, SerialQueue};
use crate::kb::chunker::Chunker;
use crate::kb::embeddings::{embed_batch, BatchOptions, Embedder};
use crate::kb::locks::OwnerLocks;
use crate::kb::vectors::{VectorIndex, VectorRecord};
use crate::validation::{confined_join, sanitize_file_name, validate_id, validate_upload};

/// A file handed to the pipeline
#[derive(Debug, Clone)]
pub struct DocumentUpload {
    pub kb_id: String,
    /// Generated when absent
    pub file_id: Option<String>,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Result of a completed ingestion
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub file_id: String,
    pub storage_path: PathBuf,
    pub extracted_text: String,
    pub chunk_count: usize,
}

/// Turns uploaded files into stored vectors, one job at a time
#[derive(Clone)]
pub struct DocumentPipeline {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    extractor: Arc<dyn TextExtractor>,
    queue: SerialQueue,
    locks: OwnerLocks,
    files_dir: PathBuf,
    chunker: Chunker,
    batch: BatchOptions,
    limits: IngestConfig,
}

impl DocumentPipeline {
    pub fn new(
        config: &RagConfig,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        extractor: Arc<dyn TextExtractor>,
        queue: SerialQueue,
        locks: OwnerLocks,
    ) -> Self {
        Self {
            embedder,
            index,
            extractor,
            queue,
            locks,
            files_dir: config.files_dir(),
            chunker: Chunker::from(config.chunking),
            batch: BatchOptions::from_config(config),
            limits: config.ingest.clone(),
        }
    }

    /// Where an upload is persisted: `<files_dir>/<kb_id>/<file_id>_<name>`
    pub fn storage_path(&self, kb_id: &str, file_id: &str, file_name: &str) -> Result<PathBuf, IngestError> {
        let relative = Path::new(kb_id).join(format!("{}_{}", file_id, sanitize_file_name(file_name)));
        Ok(confined_join(&self.files_dir, &relative)?)
    }

    /// Ingest one upload. Validation happens before the job is queued; the
    /// rest runs on the serial queue behind any earlier embedding work.
    pub async fn ingest(
        &self,
        upload: DocumentUpload,
        on_event: ProgressCallback,
    ) -> Result<IngestOutcome, IngestError> {
        let file_id = upload
            .file_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let reporter = StageReporter::new(on_event);
        let mut job = IngestionJob::new(&upload.kb_id, &file_id);

        reporter.advance(&mut job, IngestStage::Validating, 0.0, "Validating file");
        if let Err(e) = self.validate(&upload, &file_id) {
            tracing::warn!("Rejected upload {:?}: {}", upload.file_name, e);
            reporter.failed(&mut job, &e);
            return Err(e);
        }
        reporter.advance(&mut job, IngestStage::Validating, 5.0, "File accepted");

        let pipeline = self.clone();
        self.queue
            .run(JobType::IngestDocument, async move {
                pipeline.run_job(upload, job, reporter).await
            })
            .await?
    }

    fn validate(&self, upload: &DocumentUpload, file_id: &str) -> Result<(), IngestError> {
        validate_id("kb_id", &upload.kb_id)?;
        validate_id("file_id", file_id)?;
        validate_upload(&upload.file_name, upload.bytes.len() as u64, &self.limits)?;
        Ok(())
    }

    async fn run_job(
        &self,
        upload: DocumentUpload,
        mut job: IngestionJob,
        reporter: StageReporter,
    ) -> Result<IngestOutcome, IngestError> {
        let _guard = self.locks.lock(&job.owner_id).await;

        match self.process(&upload, &mut job, &reporter).await {
            Ok(outcome) => {
                reporter.completed(&mut job, outcome.chunk_count);
                tracing::info!(
                    "Ingested {} into {} ({} chunks)",
                    upload.file_name,
                    job.owner_id,
                    outcome.chunk_count
                );
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(
                    "Ingestion of {} failed at {}: {}",
                    upload.file_name,
                    job.stage.name(),
                    e
                );
                self.rollback(&job).await;
                reporter.failed(&mut job, &e);
                Err(e)
            }
        }
    }

    async fn process(
        &self,
        upload: &DocumentUpload,
        job: &mut IngestionJob,
        reporter: &StageReporter,
    ) -> Result<IngestOutcome, IngestError> {
        // Saving: staged under a temporary name until the vectors verify, so a
        // failed re-ingest leaves the published file alone
        reporter.advance(job, IngestStage::Saving, 10.0, "Saving file");
        let path = self.storage_path(&job.owner_id, &job.file_id, &upload.file_name)?;
        let staged = staging_path(&path, &job.job_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Recorded before the write so a partial file is cleaned up too
        job.staged_path = Some(staged.clone());
        tokio::fs::write(&staged, &upload.bytes).await?;

        // Extracting
        reporter.advance(job, IngestStage::Extracting, 20.0, "Extracting text");
        let extractor = self.extractor.clone();
        let source = staged.clone();
        let text = tokio::task::spawn_blocking(move || extractor.extract(&source))
            .await
            .map_err(std::io::Error::other)??;
        if text.trim().is_empty() {
            return Err(IngestError::EmptyText(upload.file_name.clone()));
        }

        // Chunking
        reporter.advance(job, IngestStage::Chunking, 30.0, "Splitting into chunks");
        let chunks = self.chunker.chunk(&text);
        if chunks.is_empty() {
            return Err(IngestError::EmptyText(upload.file_name.clone()));
        }

        // Embedding
        reporter.advance(
            job,
            IngestStage::Embedding { percent: 0.0 },
            40.0,
            "Checking embedding model",
        );
        let model = self.embedder.model().to_string();
        let progress_reporter = reporter.clone();
        let progress_job = parking_lot::Mutex::new(job.clone());
        let available = self
            .embedder
            .ensure_model_available(&model, &|fraction| {
                let mut snapshot = progress_job.lock();
                progress_reporter.advance(
                    &mut snapshot,
                    IngestStage::Embedding { percent: 0.0 },
                    scale(fraction, 40.0, 50.0),
                    "Preparing embedding model",
                );
            })
            .await?;
        if !available {
            return Err(IngestError::ModelUnavailable(model));
        }

        let total = chunks.len();
        let vectors = embed_batch(self.embedder.as_ref(), &chunks, &self.batch, |p| {
            let mut snapshot = progress_job.lock();
            progress_reporter.advance(
                &mut snapshot,
                IngestStage::Embedding { percent: p.percent },
                scale(p.percent / 100.0, 50.0, 90.0),
                format!("Embedded {}/{} chunks", p.processed, total),
            );
        })
        .await?;

        // Storing
        reporter.advance(job, IngestStage::Storing, 95.0, "Storing vectors");
        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (content, embedding))| VectorRecord {
                id: format!("{}_{}", job.file_id, i),
                file_id: job.file_id.clone(),
                content: content.clone(),
                embedding,
            })
            .collect();

        if !self.index.collection_exists(&job.owner_id).await? {
            self.index.create_collection(&job.owner_id).await?;
        }
        // Re-ingesting a file replaces its vectors; the old ones are kept
        // in memory until the new set verifies
        job.previous_vectors = self.index.file_records(&job.owner_id, &job.file_id).await?;
        job.storing_started = true;
        self.index.delete_by_file(&job.owner_id, &job.file_id).await?;
        self.index.insert(&job.owner_id, &records).await?;

        let stored = self.index.count_by_file(&job.owner_id, &job.file_id).await?;
        if stored != records.len() {
            return Err(IngestError::CountMismatch {
                file_id: job.file_id.clone(),
                expected: records.len(),
                actual: stored,
            });
        }

        tokio::fs::rename(&staged, &path).await?;
        job.staged_path = None;

        Ok(IngestOutcome {
            file_id: job.file_id.clone(),
            storage_path: path,
            extracted_text: text,
            chunk_count: records.len(),
        })
    }

    /// Undo recorded side effects: vectors first, then the staged file.
    /// Vectors the file had before this run are put back. Failures are
    /// logged; the original error is what the caller sees.
    async fn rollback(&self, job: &IngestionJob) {
        if job.storing_started {
            match self.index.delete_by_file(&job.owner_id, &job.file_id).await {
                Ok(()) => {
                    tracing::info!("Rolled back vectors for {}", job.file_id);
                    if !job.previous_vectors.is_empty() {
                        match self.index.insert(&job.owner_id, &job.previous_vectors).await {
                            Ok(()) => tracing::info!(
                                "Restored {} previous vectors for {}",
                                job.previous_vectors.len(),
                                job.file_id
                            ),
                            Err(e) => tracing::error!(
                                "Rollback: failed to restore vectors for {}: {}",
                                job.file_id,
                                e
                            ),
                        }
                    }
                }
                Err(e) => tracing::error!(
                    "Rollback: failed to delete vectors for {}: {}",
                    job.file_id,
                    e
                ),
            }
        }

        if let Some(path) = &job.staged_path {
            match tokio::fs::remove_file(path).await {
                Ok(()) => tracing::info!("Rolled back staged file {:?}", path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::error!("Rollback: failed to remove {:?}: {}", path, e),
            }
        }
    }
}

/// Hidden sibling of the final path. The extension is kept for the extractor.
fn staging_path(path: &Path, job_id: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}", job_id, name))
}
