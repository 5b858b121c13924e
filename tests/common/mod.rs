//! Common test utilities for LocalRAG integration tests
//!
//! In-memory fakes for the embedder, vector index and metadata store, plus a
//! temp-dir backed context and a config tuned for fast tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use localrag_lib::config::RagConfig;
use localrag_lib::kb::embeddings::{Embedder, EmbeddingError};
use localrag_lib::kb::ingest::{PipelineEvent, ProgressCallback};
use localrag_lib::kb::metadata::{
    FileRecord, MetadataError, MetadataStore, NoteRecord, SourceInfo, SourceKind,
};
use localrag_lib::kb::vectors::{sort_by_distance, VectorError, VectorHit, VectorIndex, VectorRecord};
use localrag_lib::retry::RetryPolicy;

pub const TEST_DIM: usize = 8;

/// Ordered record of calls across several fakes
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Position of the first entry starting with `prefix`
pub fn position(log: &CallLog, prefix: &str) -> Option<usize> {
    log.lock().iter().position(|entry| entry.starts_with(prefix))
}

// ============================================================================
// Test context
// ============================================================================

/// Test context holding temporary resources
pub struct TestContext {
    pub temp_dir: TempDir,
    pub config: RagConfig,
}

impl TestContext {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let temp_dir = TempDir::new()?;
        let config = test_config(temp_dir.path());
        Ok(Self { temp_dir, config })
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Every file currently stored under the files directory
    pub fn stored_files(&self) -> Vec<PathBuf> {
        let root = self.config.files_dir();
        if !root.exists() {
            return Vec::new();
        }
        walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect()
    }
}

/// Defaults with no delays, one attempt per call and a small dimension
pub fn test_config(data_dir: &Path) -> RagConfig {
    let mut config = RagConfig::default();
    config.data_dir = data_dir.to_path_buf();
    config.runtime.probe_timeout_ms = 200;
    config.runtime.ready_poll = RetryPolicy::fixed(3, Duration::from_millis(10));
    config.embedding.dimension = TEST_DIM;
    config.embedding.request_timeout_secs = 2;
    config.embedding.retry = RetryPolicy::fixed(1, Duration::ZERO);
    config.embedding.inter_call_delay_ms = 0;
    config.embedding.model_poll = RetryPolicy::fixed(2, Duration::from_millis(10));
    config
}

/// Callback that stores every event
pub fn recording_events() -> (ProgressCallback, Arc<Mutex<Vec<PipelineEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let callback: ProgressCallback = Arc::new(move |event| sink.lock().push(event));
    (callback, events)
}

/// Plain text of exactly `len` characters with no whitespace
pub fn sample_text(len: usize) -> String {
    "abcdefghijklmnopqrstuvwxyz".chars().cycle().take(len).collect()
}

/// Deterministic bag-of-bytes embedding, normalised
pub fn text_vector(text: &str, dim: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dim];
    for b in text.to_lowercase().bytes() {
        v[b as usize % dim] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    } else {
        v[0] = 1.0;
    }
    v
}

fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 1.0;
    }
    1.0 - dot / (na * nb)
}

// ============================================================================
// ScriptedEmbedder
// ============================================================================

/// Embedder with scripted availability, failures and latency
pub struct ScriptedEmbedder {
    model: String,
    dim: usize,
    available: bool,
    delay: Option<Duration>,
    fail_containing: Mutex<Option<String>>,
    log: CallLog,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    pub embed_calls: AtomicUsize,
    pub availability_checks: AtomicUsize,
}

impl ScriptedEmbedder {
    pub fn new() -> Self {
        Self::with_log(call_log())
    }

    pub fn with_log(log: CallLog) -> Self {
        Self {
            model: "nomic-embed-text".to_string(),
            dim: TEST_DIM,
            available: true,
            delay: None,
            fail_containing: Mutex::new(None),
            log,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            embed_calls: AtomicUsize::new(0),
            availability_checks: AtomicUsize::new(0),
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every embed whose text contains `needle`
    pub fn fail_on(self, needle: &str) -> Self {
        *self.fail_containing.lock() = Some(needle.to_string());
        self
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for ScriptedEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(format!("embed:{}", text.chars().take(16).collect::<String>()));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self
            .fail_containing
            .lock()
            .as_ref()
            .map(|needle| text.contains(needle.as_str()))
            .unwrap_or(false);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if failing {
            return Err(EmbeddingError::Upstream {
                status: 500,
                body: "scripted failure".to_string(),
            });
        }
        Ok(text_vector(text, self.dim))
    }

    async fn ensure_model_available(
        &self,
        _model: &str,
        on_progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<bool, EmbeddingError> {
        self.availability_checks.fetch_add(1, Ordering::SeqCst);
        on_progress(1.0);
        Ok(self.available)
    }
}

// ============================================================================
// MemoryIndex
// ============================================================================

/// In-memory vector index with call recording and fault injection
#[derive(Default)]
pub struct MemoryIndex {
    collections: Mutex<HashMap<String, Vec<VectorRecord>>>,
    log: CallLog,
    drops: AtomicUsize,
    /// The next insert silently keeps only this many records
    truncate_inserts_to: Mutex<Option<usize>>,
    fail_drop: Mutex<bool>,
    failing_searches: Mutex<HashSet<String>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(log: CallLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    pub fn truncate_inserts_to(&self, keep: usize) {
        *self.truncate_inserts_to.lock() = Some(keep);
    }

    pub fn fail_drops(&self) {
        *self.fail_drop.lock() = true;
    }

    pub fn fail_search_in(&self, owner_id: &str) {
        self.failing_searches.lock().insert(owner_id.to_string());
    }

    pub fn drop_count(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }

    pub fn records(&self, owner_id: &str) -> Vec<VectorRecord> {
        self.collections
            .lock()
            .get(owner_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_collection(&self, owner_id: &str) -> bool {
        self.collections.lock().contains_key(owner_id)
    }

    /// Seed a collection directly
    pub fn seed(&self, owner_id: &str, records: Vec<VectorRecord>) {
        self.collections
            .lock()
            .entry(owner_id.to_string())
            .or_default()
            .extend(records);
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn create_collection(&self, owner_id: &str) -> Result<(), VectorError> {
        self.log.lock().push(format!("create:{}", owner_id));
        self.collections.lock().entry(owner_id.to_string()).or_default();
        Ok(())
    }

    async fn drop_collection(&self, owner_id: &str) -> Result<(), VectorError> {
        self.log.lock().push(format!("drop:{}", owner_id));
        self.drops.fetch_add(1, Ordering::SeqCst);
        if *self.fail_drop.lock() {
            return Err(VectorError::LanceDb("injected drop failure".to_string()));
        }
        self.collections.lock().remove(owner_id);
        Ok(())
    }

    async fn collection_exists(&self, owner_id: &str) -> Result<bool, VectorError> {
        Ok(self.has_collection(owner_id))
    }

    async fn insert(&self, owner_id: &str, records: &[VectorRecord]) -> Result<(), VectorError> {
        self.log.lock().push(format!("insert:{}:{}", owner_id, records.len()));
        let keep = self.truncate_inserts_to.lock().take().unwrap_or(records.len());
        let mut collections = self.collections.lock();
        let collection = collections
            .get_mut(owner_id)
            .ok_or_else(|| VectorError::CollectionNotFound(owner_id.to_string()))?;
        collection.extend(records.iter().take(keep).cloned());
        Ok(())
    }

    async fn delete_by_file(&self, owner_id: &str, file_id: &str) -> Result<(), VectorError> {
        self.log.lock().push(format!("delete_by_file:{}:{}", owner_id, file_id));
        if let Some(collection) = self.collections.lock().get_mut(owner_id) {
            collection.retain(|r| r.file_id != file_id);
        }
        Ok(())
    }

    async fn count_by_file(&self, owner_id: &str, file_id: &str) -> Result<usize, VectorError> {
        Ok(self
            .collections
            .lock()
            .get(owner_id)
            .map(|c| c.iter().filter(|r| r.file_id == file_id).count())
            .unwrap_or(0))
    }

    async fn file_records(&self, owner_id: &str, file_id: &str) -> Result<Vec<VectorRecord>, VectorError> {
        Ok(self
            .collections
            .lock()
            .get(owner_id)
            .map(|c| c.iter().filter(|r| r.file_id == file_id).cloned().collect())
            .unwrap_or_default())
    }

    async fn search(
        &self,
        owner_id: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorHit>, VectorError> {
        if self.failing_searches.lock().contains(owner_id) {
            return Err(VectorError::LanceDb("injected search failure".to_string()));
        }
        let collections = self.collections.lock();
        let Some(collection) = collections.get(owner_id) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<VectorHit> = collection
            .iter()
            .map(|r| VectorHit {
                collection_id: owner_id.to_string(),
                id: r.id.clone(),
                file_id: r.file_id.clone(),
                content: r.content.clone(),
                distance: cosine_distance(&r.embedding, query),
            })
            .collect();
        sort_by_distance(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }
}

// ============================================================================
// MemoryMetadata
// ============================================================================

/// In-memory metadata collaborator
#[derive(Default)]
pub struct MemoryMetadata {
    files: Mutex<HashMap<String, HashMap<String, FileRecord>>>,
    notes: Mutex<HashMap<String, NoteRecord>>,
    log: CallLog,
    fail_writes: Mutex<bool>,
}

impl MemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log(log: CallLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    pub fn fail_writes(&self) {
        *self.fail_writes.lock() = true;
    }

    pub fn has_knowledge_base(&self, kb_id: &str) -> bool {
        self.files.lock().contains_key(kb_id)
    }

    pub fn has_note(&self, note_id: &str) -> bool {
        self.notes.lock().contains_key(note_id)
    }

    fn check_writable(&self) -> Result<(), MetadataError> {
        if *self.fail_writes.lock() {
            return Err(MetadataError::Backend("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadata {
    async fn source_info(
        &self,
        collection_id: &str,
        file_id: &str,
    ) -> Result<Option<SourceInfo>, MetadataError> {
        if let Some(file) = self.files.lock().get(collection_id).and_then(|f| f.get(file_id)) {
            return Ok(Some(SourceInfo {
                collection_id: collection_id.to_string(),
                file_id: file_id.to_string(),
                title: file.file_name.clone(),
                kind: SourceKind::KnowledgeBase,
            }));
        }
        Ok(self.notes.lock().get(collection_id).map(|n| SourceInfo {
            collection_id: collection_id.to_string(),
            file_id: file_id.to_string(),
            title: n.title.clone(),
            kind: SourceKind::Note,
        }))
    }

    async fn file(&self, kb_id: &str, file_id: &str) -> Result<Option<FileRecord>, MetadataError> {
        Ok(self.files.lock().get(kb_id).and_then(|f| f.get(file_id)).cloned())
    }

    async fn note(&self, note_id: &str) -> Result<Option<NoteRecord>, MetadataError> {
        Ok(self.notes.lock().get(note_id).cloned())
    }

    async fn files(&self, kb_id: &str) -> Result<Vec<FileRecord>, MetadataError> {
        Ok(self
            .files
            .lock()
            .get(kb_id)
            .map(|f| f.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert_file(&self, record: FileRecord) -> Result<(), MetadataError> {
        self.check_writable()?;
        self.log
            .lock()
            .push(format!("metadata_upsert_file:{}:{}", record.kb_id, record.file_id));
        self.files
            .lock()
            .entry(record.kb_id.clone())
            .or_default()
            .insert(record.file_id.clone(), record);
        Ok(())
    }

    async fn upsert_note(&self, record: NoteRecord) -> Result<(), MetadataError> {
        self.check_writable()?;
        self.log.lock().push(format!("metadata_upsert_note:{}", record.note_id));
        self.notes.lock().insert(record.note_id.clone(), record);
        Ok(())
    }

    async fn delete_knowledge_base(&self, kb_id: &str) -> Result<(), MetadataError> {
        self.log.lock().push(format!("metadata_delete_kb:{}", kb_id));
        self.files
            .lock()
            .remove(kb_id)
            .map(|_| ())
            .ok_or_else(|| MetadataError::NotFound(format!("knowledge base {}", kb_id)))
    }

    async fn delete_note(&self, note_id: &str) -> Result<(), MetadataError> {
        self.log.lock().push(format!("metadata_delete_note:{}", note_id));
        self.notes
            .lock()
            .remove(note_id)
            .map(|_| ())
            .ok_or_else(|| MetadataError::NotFound(format!("note {}", note_id)))
    }

    async fn delete_file(&self, kb_id: &str, file_id: &str) -> Result<(), MetadataError> {
        self.log.lock().push(format!("metadata_delete_file:{}:{}", kb_id, file_id));
        self.files
            .lock()
            .get_mut(kb_id)
            .and_then(|f| f.remove(file_id))
            .map(|_| ())
            .ok_or_else(|| MetadataError::NotFound(format!("file {}", file_id)))
    }
}

/// A record embedded with `text_vector`
pub fn record(file_id: &str, index: usize, content: &str) -> VectorRecord {
    VectorRecord {
        id: format!("{}_{}", file_id, index),
        file_id: file_id.to_string(),
        content: content.to_string(),
        embedding: text_vector(content, TEST_DIM),
    }
}
