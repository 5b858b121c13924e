//! Note embedding pipeline
//! Re-embedding a note always replaces its collection

use std::sync::Arc;

use serde::Serialize;

use super::{scale, IngestError, IngestStage, IngestionJob, ProgressCallback, StageReporter};
use crate::config::RagConfig;
use crate::jobs::{JobType, SerialQueue};
use crate::kb::chunker::Chunker;
use crate::kb::embeddings::{embed_batch, BatchOptions, Embedder};
use crate::kb::locks::OwnerLocks;
use crate::kb::vectors::{VectorIndex, VectorRecord};
use crate::validation::{validate_id, validate_non_empty, validate_text_size, MAX_TEXT_INPUT_BYTES};

#[derive(Debug, Clone)]
pub struct NoteInput {
    pub note_id: String,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NoteOutcome {
    pub note_id: String,
    pub chunk_count: usize,
}

/// Embeds notes into their own collection, through the shared serial queue
#[derive(Clone)]
pub struct NotePipeline {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    queue: SerialQueue,
    locks: OwnerLocks,
    chunker: Chunker,
    batch: BatchOptions,
}

impl NotePipeline {
    pub fn new(
        config: &RagConfig,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        queue: SerialQueue,
        locks: OwnerLocks,
    ) -> Self {
        Self {
            embedder,
            index,
            queue,
            locks,
            chunker: Chunker::from(config.chunking),
            batch: BatchOptions::from_config(config),
        }
    }

    pub async fn embed(
        &self,
        note: NoteInput,
        on_event: ProgressCallback,
    ) -> Result<NoteOutcome, IngestError> {
        let reporter = StageReporter::new(on_event);
        let mut job = IngestionJob::new(&note.note_id, &note.note_id);

        reporter.advance(&mut job, IngestStage::Validating, 0.0, "Validating note");
        let validated = validate_id("note_id", &note.note_id)
            .and_then(|_| validate_non_empty(&note.content))
            .and_then(|_| validate_text_size(&note.content, MAX_TEXT_INPUT_BYTES));
        if let Err(e) = validated {
            let e = IngestError::from(e);
            reporter.failed(&mut job, &e);
            return Err(e);
        }

        let pipeline = self.clone();
        self.queue
            .run(JobType::EmbedNote, async move {
                pipeline.run_job(note, job, reporter).await
            })
            .await?
    }

    async fn run_job(
        &self,
        note: NoteInput,
        mut job: IngestionJob,
        reporter: StageReporter,
    ) -> Result<NoteOutcome, IngestError> {
        let _guard = self.locks.lock(&note.note_id).await;
        let mut table_created = false;

        match self.process(&note, &mut job, &reporter, &mut table_created).await {
            Ok(outcome) => {
                reporter.completed(&mut job, outcome.chunk_count);
                tracing::info!(
                    "Embedded note {} ({} chunks)",
                    note.note_id,
                    outcome.chunk_count
                );
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!("Embedding note {} failed: {}", note.note_id, e);
                if table_created {
                    self.discard_partial(&job).await;
                }
                reporter.failed(&mut job, &e);
                Err(e)
            }
        }
    }

    /// Drop a partially written collection, then put back the vectors the
    /// note had before this run
    async fn discard_partial(&self, job: &IngestionJob) {
        let note_id = &job.owner_id;
        if let Err(e) = self.index.drop_collection(note_id).await {
            tracing::error!("Failed to drop partial collection for note {}: {}", note_id, e);
            return;
        }
        if job.previous_vectors.is_empty() {
            return;
        }

        let restored = async {
            self.index.create_collection(note_id).await?;
            self.index.insert(note_id, &job.previous_vectors).await
        };
        match restored.await {
            Ok(()) => tracing::info!(
                "Restored {} previous vectors for note {}",
                job.previous_vectors.len(),
                note_id
            ),
            Err(e) => tracing::error!("Failed to restore previous vectors for note {}: {}", note_id, e),
        }
    }

    async fn process(
        &self,
        note: &NoteInput,
        job: &mut IngestionJob,
        reporter: &StageReporter,
        table_created: &mut bool,
    ) -> Result<NoteOutcome, IngestError> {
        reporter.advance(job, IngestStage::Chunking, 10.0, "Splitting note");
        let chunks = self.chunker.chunk(&note.content);
        if chunks.is_empty() {
            return Err(IngestError::EmptyText(note.title.clone()));
        }

        reporter.advance(
            job,
            IngestStage::Embedding { percent: 0.0 },
            20.0,
            "Checking embedding model",
        );
        let model = self.embedder.model().to_string();
        let progress_reporter = reporter.clone();
        let progress_job = parking_lot::Mutex::new(job.clone());
        let available = self
            .embedder
            .ensure_model_available(&model, &|fraction| {
                progress_reporter.advance(
                    &mut progress_job.lock(),
                    IngestStage::Embedding { percent: 0.0 },
                    scale(fraction, 20.0, 30.0),
                    "Preparing embedding model",
                );
            })
            .await?;
        if !available {
            return Err(IngestError::ModelUnavailable(model));
        }

        let total = chunks.len();
        let vectors = embed_batch(self.embedder.as_ref(), &chunks, &self.batch, |p| {
            progress_reporter.advance(
                &mut progress_job.lock(),
                IngestStage::Embedding { percent: p.percent },
                scale(p.percent / 100.0, 30.0, 90.0),
                format!("Embedded {}/{} chunks", p.processed, total),
            );
        })
        .await?;

        reporter.advance(job, IngestStage::Storing, 95.0, "Replacing note vectors");
        if self.index.collection_exists(&note.note_id).await? {
            job.previous_vectors = self.index.file_records(&note.note_id, &note.note_id).await?;
            self.index.drop_collection(&note.note_id).await?;
        }
        self.index.create_collection(&note.note_id).await?;
        *table_created = true;

        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (content, embedding))| VectorRecord {
                id: format!("{}_{}", note.note_id, i),
                file_id: note.note_id.clone(),
                content: content.clone(),
                embedding,
            })
            .collect();
        job.storing_started = true;
        self.index.insert(&note.note_id, &records).await?;

        let stored = self.index.count_by_file(&note.note_id, &note.note_id).await?;
        if stored != records.len() {
            return Err(IngestError::CountMismatch {
                file_id: note.note_id.clone(),
                expected: records.len(),
                actual: stored,
            });
        }

        Ok(NoteOutcome {
            note_id: note.note_id.clone(),
            chunk_count: records.len(),
        })
    }
}
