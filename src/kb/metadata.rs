//! Knowledge-base metadata collaborator
//! Display names and existence of files and notes. Never receives vector writes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorCategory;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Metadata backend error: {0}")]
    Backend(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Metadata encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl MetadataError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::Backend(_) | Self::Io(_) | Self::Encoding(_) => ErrorCategory::Storage,
        }
    }
}

/// What a collection belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    KnowledgeBase,
    Note,
}

/// Display metadata for a retrieved chunk's source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub collection_id: String,
    pub file_id: String,
    pub title: String,
    pub kind: SourceKind,
}

/// An ingested knowledge-base file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub kb_id: String,
    pub file_id: String,
    pub file_name: String,
    pub storage_path: PathBuf,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
}

/// An embedded note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteRecord {
    pub note_id: String,
    pub title: String,
    pub chunk_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// CRUD layer for knowledge bases, files and notes
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn source_info(
        &self,
        collection_id: &str,
        file_id: &str,
    ) -> Result<Option<SourceInfo>, MetadataError>;

    async fn file(&self, kb_id: &str, file_id: &str) -> Result<Option<FileRecord>, MetadataError>;

    async fn files(&self, kb_id: &str) -> Result<Vec<FileRecord>, MetadataError>;

    async fn note(&self, note_id: &str) -> Result<Option<NoteRecord>, MetadataError>;

    async fn upsert_file(&self, record: FileRecord) -> Result<(), MetadataError>;

    async fn upsert_note(&self, record: NoteRecord) -> Result<(), MetadataError>;

    async fn delete_knowledge_base(&self, kb_id: &str) -> Result<(), MetadataError>;

    async fn delete_note(&self, note_id: &str) -> Result<(), MetadataError>;

    async fn delete_file(&self, kb_id: &str, file_id: &str) -> Result<(), MetadataError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MetadataDocument {
    /// kb id -> file id -> record
    files: HashMap<String, HashMap<String, FileRecord>>,
    notes: HashMap<String, NoteRecord>,
}

/// Metadata kept in a single JSON file, for the CLI and embedders without a database
pub struct JsonMetadataStore {
    path: PathBuf,
    doc: Mutex<MetadataDocument>,
}

impl JsonMetadataStore {
    /// Load from `path`, starting empty when the file does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, MetadataError> {
        let path = path.into();
        let doc = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            MetadataDocument::default()
        };
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every known knowledge-base id
    pub fn knowledge_bases(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.doc.lock().files.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Every known note id
    pub fn notes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.doc.lock().notes.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn persist(&self, doc: &MetadataDocument) -> Result<(), MetadataError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(doc)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn mutate<F>(&self, f: F) -> Result<(), MetadataError>
    where
        F: FnOnce(&mut MetadataDocument) -> Result<(), MetadataError>,
    {
        // Applied to a copy so a failed write leaves memory matching disk
        let mut doc = self.doc.lock();
        let mut next = doc.clone();
        f(&mut next)?;
        self.persist(&next)?;
        *doc = next;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn source_info(
        &self,
        collection_id: &str,
        file_id: &str,
    ) -> Result<Option<SourceInfo>, MetadataError> {
        let doc = self.doc.lock();
        if let Some(file) = doc.files.get(collection_id).and_then(|f| f.get(file_id)) {
            return Ok(Some(SourceInfo {
                collection_id: collection_id.to_string(),
                file_id: file_id.to_string(),
                title: file.file_name.clone(),
                kind: SourceKind::KnowledgeBase,
            }));
        }
        Ok(doc.notes.get(collection_id).map(|note| SourceInfo {
            collection_id: collection_id.to_string(),
            file_id: file_id.to_string(),
            title: note.title.clone(),
            kind: SourceKind::Note,
        }))
    }

    async fn file(&self, kb_id: &str, file_id: &str) -> Result<Option<FileRecord>, MetadataError> {
        Ok(self
            .doc
            .lock()
            .files
            .get(kb_id)
            .and_then(|f| f.get(file_id))
            .cloned())
    }

    async fn files(&self, kb_id: &str) -> Result<Vec<FileRecord>, MetadataError> {
        let mut files: Vec<FileRecord> = self
            .doc
            .lock()
            .files
            .get(kb_id)
            .map(|f| f.values().cloned().collect())
            .unwrap_or_default();
        files.sort_by_key(|f| f.created_at);
        Ok(files)
    }

    async fn note(&self, note_id: &str) -> Result<Option<NoteRecord>, MetadataError> {
        Ok(self.doc.lock().notes.get(note_id).cloned())
    }

    async fn upsert_file(&self, record: FileRecord) -> Result<(), MetadataError> {
        self.mutate(|doc| {
            doc.files
                .entry(record.kb_id.clone())
                .or_default()
                .insert(record.file_id.clone(), record);
            Ok(())
        })
    }

    async fn upsert_note(&self, record: NoteRecord) -> Result<(), MetadataError> {
        self.mutate(|doc| {
            doc.notes.insert(record.note_id.clone(), record);
            Ok(())
        })
    }

    async fn delete_knowledge_base(&self, kb_id: &str) -> Result<(), MetadataError> {
        self.mutate(|doc| {
            doc.files
                .remove(kb_id)
                .map(|_| ())
                .ok_or_else(|| MetadataError::NotFound(format!("knowledge base {}", kb_id)))
        })
    }

    async fn delete_note(&self, note_id: &str) -> Result<(), MetadataError> {
        self.mutate(|doc| {
            doc.notes
                .remove(note_id)
                .map(|_| ())
                .ok_or_else(|| MetadataError::NotFound(format!("note {}", note_id)))
        })
    }

    async fn delete_file(&self, kb_id: &str, file_id: &str) -> Result<(), MetadataError> {
        self.mutate(|doc| {
            let files = doc
                .files
                .get_mut(kb_id)
                .ok_or_else(|| MetadataError::NotFound(format!("knowledge base {}", kb_id)))?;
            files
                .remove(file_id)
                .map(|_| ())
                .ok_or_else(|| MetadataError::NotFound(format!("file {}", file_id)))
        })
    }
}
