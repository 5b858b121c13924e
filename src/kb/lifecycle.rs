//! Collection lifecycle for LocalRAG
//! Deleting knowledge bases, notes and files: vectors first, then stored
//! files, then metadata. A failed vector step leaves metadata in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::error::ErrorCategory;
use crate::kb::locks::OwnerLocks;
use crate::kb::metadata::{MetadataError, MetadataStore};
use crate::kb::vectors::{VectorError, VectorIndex};
use crate::validation::{validate_id, ValidationError};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Vector(#[from] VectorError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LifecycleError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Vector(e) => e.category(),
            Self::Metadata(e) => e.category(),
            Self::Io(_) => ErrorCategory::Storage,
        }
    }
}

pub struct CollectionLifecycle {
    index: Arc<dyn VectorIndex>,
    metadata: Arc<dyn MetadataStore>,
    locks: OwnerLocks,
    files_dir: PathBuf,
}

impl CollectionLifecycle {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        metadata: Arc<dyn MetadataStore>,
        locks: OwnerLocks,
        files_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            index,
            metadata,
            locks,
            files_dir: files_dir.into(),
        }
    }

    /// Drop the collection, remove stored uploads, then delete the metadata record
    pub async fn delete_knowledge_base(&self, kb_id: &str) -> Result<(), LifecycleError> {
        let kb_id = validate_id("kb_id", kb_id)?;
        let _guard = self.locks.lock(&kb_id).await;

        self.index.drop_collection(&kb_id).await?;
        remove_dir_if_present(&self.files_dir.join(&kb_id)).await?;
        self.metadata.delete_knowledge_base(&kb_id).await?;

        tracing::info!("Deleted knowledge base {}", kb_id);
        Ok(())
    }

    pub async fn delete_note(&self, note_id: &str) -> Result<(), LifecycleError> {
        let note_id = validate_id("note_id", note_id)?;
        let _guard = self.locks.lock(&note_id).await;

        self.index.drop_collection(&note_id).await?;
        self.metadata.delete_note(&note_id).await?;

        tracing::info!("Deleted note {}", note_id);
        Ok(())
    }

    /// Remove one file's vectors and stored copy, then its metadata
    pub async fn delete_file(&self, kb_id: &str, file_id: &str) -> Result<(), LifecycleError> {
        let kb_id = validate_id("kb_id", kb_id)?;
        let file_id = validate_id("file_id", file_id)?;
        let _guard = self.locks.lock(&kb_id).await;

        self.index.delete_by_file(&kb_id, &file_id).await?;

        if let Some(record) = self.metadata.file(&kb_id, &file_id).await? {
            if record.storage_path.starts_with(&self.files_dir) {
                remove_file_if_present(&record.storage_path).await?;
            } else {
                tracing::warn!(
                    "Not removing {:?}: outside the files directory",
                    record.storage_path
                );
            }
        }
        self.metadata.delete_file(&kb_id, &file_id).await?;

        tracing::info!("Deleted file {} from knowledge base {}", file_id, kb_id);
        Ok(())
    }
}

async fn remove_dir_if_present(path: &Path) -> Result<(), std::io::Error> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

async fn remove_file_if_present(path: &Path) -> Result<(), std::io::Error> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
