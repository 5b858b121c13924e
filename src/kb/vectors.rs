//! Vector storage module for LocalRAG
//! One LanceDB table per collection (knowledge base or note), plus the
//! cross-collection merge used by retrieval
//!
//! # Security
//! File ids are allowlist-validated before they are embedded in filter
//! expressions. Collection ids map onto table names deterministically.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::types::Float32Type;
use arrow_array::{FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Connection, DistanceType, Table};
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::ErrorCategory;
use crate::validation::sanitize_id;

const TABLE_PREFIX: &str = "collection_";
const MAX_PLAIN_TABLE_ID: usize = 200;

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("LanceDB error: {0}")]
    LanceDb(String),
    #[error("Arrow error: {0}")]
    Arrow(String),
    #[error("Collection not found: {0}")]
    CollectionNotFound(String),
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("Invalid identifier: {0}")]
    InvalidId(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VectorError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::CollectionNotFound(_) => ErrorCategory::NotFound,
            Self::DimensionMismatch { .. } | Self::InvalidId(_) => ErrorCategory::Validation,
            Self::LanceDb(_) | Self::Arrow(_) | Self::Io(_) => ErrorCategory::Storage,
        }
    }
}

/// One embedded chunk
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    /// Unique within the collection
    pub id: String,
    /// File (or note) the chunk came from
    pub file_id: String,
    pub content: String,
    pub embedding: Vec<f32>,
}

/// Nearest-neighbour hit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorHit {
    pub collection_id: String,
    pub id: String,
    pub file_id: String,
    pub content: String,
    /// Smaller is more similar
    pub distance: f32,
}

impl VectorHit {
    /// Display similarity, `1 - distance` clamped to `[0, 1]`
    pub fn similarity(&self) -> f32 {
        (1.0 - self.distance).clamp(0.0, 1.0)
    }
}

/// Per-collection vector index
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Create an empty collection; no-op if it already exists
    async fn create_collection(&self, owner_id: &str) -> Result<(), VectorError>;

    /// Drop a collection; no-op if it does not exist
    async fn drop_collection(&self, owner_id: &str) -> Result<(), VectorError>;

    async fn collection_exists(&self, owner_id: &str) -> Result<bool, VectorError>;

    /// Batch insert. The collection must exist.
    async fn insert(&self, owner_id: &str, records: &[VectorRecord]) -> Result<(), VectorError>;

    /// Remove every record belonging to `file_id`
    async fn delete_by_file(&self, owner_id: &str, file_id: &str) -> Result<(), VectorError>;

    async fn count_by_file(&self, owner_id: &str, file_id: &str) -> Result<usize, VectorError>;

    /// Every record belonging to `file_id`, embeddings included. Empty when
    /// the collection does not exist.
    async fn file_records(&self, owner_id: &str, file_id: &str) -> Result<Vec<VectorRecord>, VectorError>;

    /// Nearest neighbours ordered by ascending distance
    async fn search(
        &self,
        owner_id: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorHit>, VectorError>;
}

/// Search several collections concurrently and merge by ascending distance.
/// A failing collection contributes no hits instead of failing the query.
pub async fn search_many(
    index: &dyn VectorIndex,
    owner_ids: &[String],
    query: &[f32],
    limit: usize,
) -> Vec<VectorHit> {
    if limit == 0 || owner_ids.is_empty() {
        return Vec::new();
    }

    let searches = owner_ids.iter().map(|owner| async move {
        match index.search(owner, query, limit).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!("Search in collection {} failed: {}", owner, e);
                Vec::new()
            }
        }
    });

    let mut merged: Vec<VectorHit> = futures::future::join_all(searches)
        .await
        .into_iter()
        .flatten()
        .collect();
    sort_by_distance(&mut merged);
    merged.truncate(limit);
    merged
}

/// Stable ascending sort; NaN distances sink to the end
pub fn sort_by_distance(hits: &mut [VectorHit]) {
    hits.sort_by(|a, b| match (a.distance.is_nan(), b.distance.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.distance.total_cmp(&b.distance),
    });
}

/// Deterministic table name for a collection owner id
pub fn table_name(owner_id: &str) -> String {
    match sanitize_id(owner_id) {
        Some(safe) if safe.len() <= MAX_PLAIN_TABLE_ID => format!("{}{}", TABLE_PREFIX, safe),
        _ => {
            let digest = format!("{:x}", Sha256::digest(owner_id.as_bytes()));
            format!("{}h{}", TABLE_PREFIX, &digest[..32])
        }
    }
}

fn file_filter(file_id: &str) -> Result<String, VectorError> {
    let safe = sanitize_id(file_id).ok_or_else(|| VectorError::InvalidId(file_id.to_string()))?;
    Ok(format!("file_id = '{}'", safe))
}

/// LanceDB-backed vector store
pub struct VectorStore {
    path: PathBuf,
    embedding_dim: usize,
    connection: Connection,
}

impl VectorStore {
    /// Open (or create) the store directory
    pub async fn open(path: impl Into<PathBuf>, embedding_dim: usize) -> Result<Self, VectorError> {
        let path = path.into();
        std::fs::create_dir_all(&path)?;

        let db_path = path.to_string_lossy().to_string();
        let connection = connect(&db_path)
            .execute()
            .await
            .map_err(|e| VectorError::LanceDb(e.to_string()))?;

        Ok(Self {
            path,
            embedding_dim,
            connection,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.embedding_dim as i32,
                ),
                false,
            ),
            Field::new("file_id", DataType::Utf8, false),
            Field::new("content", DataType::Utf8, false),
        ]))
    }

    fn batch(&self, records: &[VectorRecord]) -> Result<RecordBatch, VectorError> {
        let id_array = StringArray::from(records.iter().map(|r| r.id.clone()).collect::<Vec<_>>());
        let file_array =
            StringArray::from(records.iter().map(|r| r.file_id.clone()).collect::<Vec<_>>());
        let content_array =
            StringArray::from(records.iter().map(|r| r.content.clone()).collect::<Vec<_>>());
        let vector_array = FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
            records
                .iter()
                .map(|r| Some(r.embedding.iter().map(|&v| Some(v)).collect::<Vec<_>>())),
            self.embedding_dim as i32,
        );

        RecordBatch::try_new(
            self.schema(),
            vec![
                Arc::new(id_array),
                Arc::new(vector_array),
                Arc::new(file_array),
                Arc::new(content_array),
            ],
        )
        .map_err(|e| VectorError::Arrow(e.to_string()))
    }

    async fn table_names(&self) -> Result<Vec<String>, VectorError> {
        self.connection
            .table_names()
            .execute()
            .await
            .map_err(|e| VectorError::LanceDb(e.to_string()))
    }

    async fn open_table(&self, owner_id: &str) -> Result<Option<Table>, VectorError> {
        let name = table_name(owner_id);
        if !self.table_names().await?.contains(&name) {
            return Ok(None);
        }
        let table = self
            .connection
            .open_table(&name)
            .execute()
            .await
            .map_err(|e| VectorError::LanceDb(e.to_string()))?;
        Ok(Some(table))
    }

    async fn require_table(&self, owner_id: &str) -> Result<Table, VectorError> {
        self.open_table(owner_id)
            .await?
            .ok_or_else(|| VectorError::CollectionNotFound(owner_id.to_string()))
    }

    fn check_dim(&self, actual: usize) -> Result<(), VectorError> {
        if actual != self.embedding_dim {
            return Err(VectorError::DimensionMismatch {
                expected: self.embedding_dim,
                actual,
            });
        }
        Ok(())
    }

    /// Total records in a collection
    pub async fn count(&self, owner_id: &str) -> Result<usize, VectorError> {
        let table = self.require_table(owner_id).await?;
        table
            .count_rows(None)
            .await
            .map_err(|e| VectorError::LanceDb(e.to_string()))
    }
}

#[async_trait]
impl VectorIndex for VectorStore {
    async fn create_collection(&self, owner_id: &str) -> Result<(), VectorError> {
        let name = table_name(owner_id);
        if self.table_names().await?.contains(&name) {
            return Ok(());
        }

        let schema = self.schema();
        let batch = self.batch(&[])?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        self.connection
            .create_table(&name, Box::new(batches))
            .execute()
            .await
            .map_err(|e| VectorError::LanceDb(e.to_string()))?;

        tracing::debug!("Created collection {} as table {}", owner_id, name);
        Ok(())
    }

    async fn drop_collection(&self, owner_id: &str) -> Result<(), VectorError> {
        let name = table_name(owner_id);
        if !self.table_names().await?.contains(&name) {
            tracing::debug!("Collection {} does not exist, nothing to drop", owner_id);
            return Ok(());
        }
        self.connection
            .drop_table(&name)
            .await
            .map_err(|e| VectorError::LanceDb(e.to_string()))?;
        tracing::info!("Dropped collection {}", owner_id);
        Ok(())
    }

    async fn collection_exists(&self, owner_id: &str) -> Result<bool, VectorError> {
        Ok(self.table_names().await?.contains(&table_name(owner_id)))
    }

    async fn insert(&self, owner_id: &str, records: &[VectorRecord]) -> Result<(), VectorError> {
        if records.is_empty() {
            return Ok(());
        }
        for record in records {
            self.check_dim(record.embedding.len())?;
        }

        let table = self.require_table(owner_id).await?;
        let batch = self.batch(records)?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], self.schema());
        table
            .add(Box::new(batches))
            .execute()
            .await
            .map_err(|e| VectorError::LanceDb(e.to_string()))?;
        Ok(())
    }

    async fn delete_by_file(&self, owner_id: &str, file_id: &str) -> Result<(), VectorError> {
        let filter = file_filter(file_id)?;
        let Some(table) = self.open_table(owner_id).await? else {
            return Ok(());
        };
        table
            .delete(&filter)
            .await
            .map_err(|e| VectorError::LanceDb(e.to_string()))?;
        Ok(())
    }

    async fn count_by_file(&self, owner_id: &str, file_id: &str) -> Result<usize, VectorError> {
        let filter = file_filter(file_id)?;
        let Some(table) = self.open_table(owner_id).await? else {
            return Ok(0);
        };
        table
            .count_rows(Some(filter))
            .await
            .map_err(|e| VectorError::LanceDb(e.to_string()))
    }

    async fn file_records(&self, owner_id: &str, file_id: &str) -> Result<Vec<VectorRecord>, VectorError> {
        let filter = file_filter(file_id)?;
        let Some(table) = self.open_table(owner_id).await? else {
            return Ok(Vec::new());
        };

        let results = table
            .query()
            .only_if(filter)
            .execute()
            .await
            .map_err(|e: lancedb::Error| VectorError::LanceDb(e.to_string()))?;

        use futures::StreamExt;
        let batches: Vec<Result<RecordBatch, lancedb::Error>> = results.collect().await;

        let mut records = Vec::new();
        for batch_result in batches {
            let batch =
                batch_result.map_err(|e: lancedb::Error| VectorError::LanceDb(e.to_string()))?;

            let ids = string_column(&batch, "id")?;
            let file_ids = string_column(&batch, "file_id")?;
            let contents = string_column(&batch, "content")?;
            let vectors = batch
                .column_by_name("vector")
                .ok_or_else(|| VectorError::LanceDb("Missing vector column".into()))?
                .as_any()
                .downcast_ref::<FixedSizeListArray>()
                .ok_or_else(|| VectorError::Arrow("Invalid vector column type".into()))?;

            for i in 0..batch.num_rows() {
                let row = vectors.value(i);
                let values = row
                    .as_any()
                    .downcast_ref::<Float32Array>()
                    .ok_or_else(|| VectorError::Arrow("Invalid vector item type".into()))?;
                records.push(VectorRecord {
                    id: ids.value(i).to_string(),
                    file_id: file_ids.value(i).to_string(),
                    content: contents.value(i).to_string(),
                    embedding: values.values().to_vec(),
                });
            }
        }

        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn search(
        &self,
        owner_id: &str,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<VectorHit>, VectorError> {
        self.check_dim(query.len())?;
        let table = self.require_table(owner_id).await?;

        let results = table
            .vector_search(query)
            .map_err(|e| VectorError::LanceDb(e.to_string()))?
            .distance_type(DistanceType::Cosine)
            .limit(limit)
            .execute()
            .await
            .map_err(|e: lancedb::Error| VectorError::LanceDb(e.to_string()))?;

        use futures::StreamExt;
        let batches: Vec<Result<RecordBatch, lancedb::Error>> = results.collect().await;

        let mut hits = Vec::new();
        for batch_result in batches {
            let batch =
                batch_result.map_err(|e: lancedb::Error| VectorError::LanceDb(e.to_string()))?;

            let ids = string_column(&batch, "id")?;
            let file_ids = string_column(&batch, "file_id")?;
            let contents = string_column(&batch, "content")?;
            let distances = batch
                .column_by_name("_distance")
                .ok_or_else(|| VectorError::LanceDb("Missing _distance column".into()))?
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| VectorError::Arrow("Invalid distance column type".into()))?;

            for i in 0..batch.num_rows() {
                hits.push(VectorHit {
                    collection_id: owner_id.to_string(),
                    id: ids.value(i).to_string(),
                    file_id: file_ids.value(i).to_string(),
                    content: contents.value(i).to_string(),
                    distance: distances.value(i),
                });
            }
        }

        sort_by_distance(&mut hits);
        Ok(hits)
    }
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray, VectorError> {
    batch
        .column_by_name(name)
        .ok_or_else(|| VectorError::LanceDb(format!("Missing {} column", name)))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| VectorError::Arrow(format!("Invalid {} column type", name)))
}
