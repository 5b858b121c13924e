//! LocalRAG - Offline document-to-answer pipeline backed by a local embedding runtime

pub mod config;
pub mod error;
pub mod jobs;
pub mod kb;
pub mod retry;
pub mod runtime;
pub mod validation;

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;

use crate::config::RagConfig;
use crate::error::AppError;
use crate::jobs::SerialQueue;
use crate::kb::embeddings::{Embedder, EmbeddingClient};
use crate::kb::ingest::{
    DocumentPipeline, DocumentUpload, IngestOutcome, NoteInput, NoteOutcome, NotePipeline,
    PlainTextExtractor, ProgressCallback, TextExtractor,
};
use crate::kb::lifecycle::CollectionLifecycle;
use crate::kb::locks::OwnerLocks;
use crate::kb::metadata::{FileRecord, JsonMetadataStore, MetadataStore, NoteRecord};
use crate::kb::search::{RagAssembler, RetrievedSnippet};
use crate::kb::vectors::{VectorIndex, VectorStore};
use crate::runtime::process::{ProcessControl, SystemProcessControl};
use crate::runtime::{ProvisioningState, RuntimeProvisioner};

/// File name of the metadata store under the data directory
pub const METADATA_FILE: &str = "metadata.json";

/// Collaborators a host may substitute when wiring services
pub struct ServiceParts {
    pub process: Arc<dyn ProcessControl>,
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub metadata: Arc<dyn MetadataStore>,
    pub extractor: Arc<dyn TextExtractor>,
}

/// Everything an embedding host needs, wired once per process
pub struct RagServices {
    pub config: RagConfig,
    pub provisioner: Arc<RuntimeProvisioner>,
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub metadata: Arc<dyn MetadataStore>,
    pub queue: SerialQueue,
    pub locks: OwnerLocks,
    pub documents: DocumentPipeline,
    pub notes: NotePipeline,
    pub assembler: RagAssembler,
    pub lifecycle: CollectionLifecycle,
}

impl RagServices {
    /// Wire the default stack: system processes, the HTTP embedding client,
    /// LanceDB under `data_dir/vectors` and JSON metadata under `data_dir`.
    /// Must be called inside a tokio runtime.
    pub async fn new(config: RagConfig) -> Result<Self, AppError> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| AppError::storage_failed(error::ErrorCode::STORAGE_IO_FAILED, e.to_string()))?;

        let embedder = Arc::new(EmbeddingClient::new(&config)?);
        let store = Arc::new(VectorStore::open(config.vectors_dir(), config.embedding.dimension).await?);
        let metadata = Arc::new(JsonMetadataStore::open(config.data_dir.join(METADATA_FILE))?);

        Self::with_parts(
            config,
            ServiceParts {
                process: Arc::new(SystemProcessControl::default()),
                embedder,
                index: store,
                metadata,
                extractor: Arc::new(PlainTextExtractor),
            },
        )
    }

    pub fn with_parts(config: RagConfig, parts: ServiceParts) -> Result<Self, AppError> {
        let provisioner = Arc::new(RuntimeProvisioner::new(&config, parts.process)?);
        let queue = SerialQueue::new();
        let locks = OwnerLocks::new();

        let documents = DocumentPipeline::new(
            &config,
            parts.embedder.clone(),
            parts.index.clone(),
            parts.extractor,
            queue.clone(),
            locks.clone(),
        );
        let notes = NotePipeline::new(
            &config,
            parts.embedder.clone(),
            parts.index.clone(),
            queue.clone(),
            locks.clone(),
        );
        let assembler = RagAssembler::new(
            &config,
            parts.embedder.clone(),
            parts.index.clone(),
            parts.metadata.clone(),
            queue.clone(),
        );
        let lifecycle = CollectionLifecycle::new(
            parts.index.clone(),
            parts.metadata.clone(),
            locks.clone(),
            config.files_dir(),
        );

        Ok(Self {
            config,
            provisioner,
            embedder: parts.embedder,
            index: parts.index,
            metadata: parts.metadata,
            queue,
            locks,
            documents,
            notes,
            assembler,
            lifecycle,
        })
    }

    /// Detect or launch the runtime
    pub async fn start(&self) -> Result<ProvisioningState, AppError> {
        Ok(self.provisioner.initialize().await?)
    }

    /// Stop the runtime if it was launched by this process
    pub async fn stop(&self) -> Result<(), AppError> {
        Ok(self.provisioner.shutdown().await?)
    }

    /// Run `op` with the runtime started, then stop it again if this process
    /// launched it. Stop runs on both paths; the error of `op` wins.
    pub async fn with_runtime<T, F>(&self, op: F) -> Result<T, AppError>
    where
        F: Future<Output = Result<T, AppError>>,
    {
        self.start().await?;
        let result = op.await;
        if let Err(e) = self.stop().await {
            tracing::warn!("Failed to stop runtime: {}", e);
            if result.is_ok() {
                return Err(e);
            }
        }
        result
    }

    /// Ingest a document and record it with the metadata store. When the
    /// metadata write fails for a new file its vectors and stored file are
    /// removed again; a file that already had a record keeps the new content
    /// its existing record points at.
    pub async fn ingest_document(
        &self,
        upload: DocumentUpload,
        on_event: ProgressCallback,
    ) -> Result<IngestOutcome, AppError> {
        let kb_id = upload.kb_id.clone();
        let file_name = upload.file_name.clone();
        let known = match &upload.file_id {
            Some(file_id) => self.metadata.file(&kb_id, file_id).await?.is_some(),
            None => false,
        };
        let outcome = self.documents.ingest(upload, on_event).await?;

        let record = FileRecord {
            kb_id: kb_id.clone(),
            file_id: outcome.file_id.clone(),
            file_name,
            storage_path: outcome.storage_path.clone(),
            chunk_count: outcome.chunk_count,
            created_at: Utc::now(),
        };
        if let Err(e) = self.metadata.upsert_file(record).await {
            if known {
                tracing::error!(
                    "Updating the record of file {} in knowledge base {} failed: {}",
                    outcome.file_id,
                    kb_id,
                    e
                );
                return Err(e.into());
            }
            tracing::error!(
                "Recording file {} in knowledge base {} failed, removing its vectors: {}",
                outcome.file_id,
                kb_id,
                e
            );
            let _guard = self.locks.lock(&kb_id).await;
            if let Err(cleanup) = self.index.delete_by_file(&kb_id, &outcome.file_id).await {
                tracing::error!("Vector cleanup for {} failed: {}", outcome.file_id, cleanup);
            }
            if let Err(cleanup) = tokio::fs::remove_file(&outcome.storage_path).await {
                tracing::error!("Removing {:?} failed: {}", outcome.storage_path, cleanup);
            }
            return Err(e.into());
        }

        Ok(outcome)
    }

    /// Embed a note and record it with the metadata store. The collection
    /// of a note without a record is dropped again if the write fails.
    pub async fn embed_note(
        &self,
        note: NoteInput,
        on_event: ProgressCallback,
    ) -> Result<NoteOutcome, AppError> {
        let title = note.title.clone();
        let known = self.metadata.note(&note.note_id).await?.is_some();
        let outcome = self.notes.embed(note, on_event).await?;

        let record = NoteRecord {
            note_id: outcome.note_id.clone(),
            title,
            chunk_count: outcome.chunk_count,
            updated_at: Utc::now(),
        };
        if let Err(e) = self.metadata.upsert_note(record).await {
            if known {
                tracing::error!("Updating the record of note {} failed: {}", outcome.note_id, e);
                return Err(e.into());
            }
            tracing::error!(
                "Recording note {} failed, dropping its collection: {}",
                outcome.note_id,
                e
            );
            let _guard = self.locks.lock(&outcome.note_id).await;
            if let Err(cleanup) = self.index.drop_collection(&outcome.note_id).await {
                tracing::error!("Dropping note collection {} failed: {}", outcome.note_id, cleanup);
            }
            return Err(e.into());
        }

        Ok(outcome)
    }

    pub async fn search(
        &self,
        query: &str,
        collection_ids: &[String],
        limit: Option<usize>,
    ) -> Result<Vec<RetrievedSnippet>, AppError> {
        Ok(self.assembler.retrieve(query, collection_ids, limit).await?)
    }

    /// Ranked snippets rendered as a prompt context block
    pub async fn context_for(
        &self,
        query: &str,
        collection_ids: &[String],
        limit: Option<usize>,
    ) -> Result<String, AppError> {
        let snippets = self.search(query, collection_ids, limit).await?;
        Ok(self.assembler.format_context(&snippets))
    }
}
