//! RAG context assembly for LocalRAG
//! Embeds the query once, searches every requested collection and merges by distance

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::config::RagConfig;
use crate::error::ErrorCategory;
use crate::jobs::{JobType, QueueError, SerialQueue};
use crate::kb::embeddings::{embed_with_retry, Embedder, EmbeddingError};
use crate::kb::metadata::{MetadataStore, SourceKind};
use crate::kb::vectors::{search_many, VectorIndex};
use crate::retry::RetryPolicy;
use crate::validation::{validate_non_empty, validate_text_size, ValidationError, MAX_TEXT_INPUT_BYTES};

#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl SearchError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Embedding(e) => e.category(),
            Self::Queue(e) => e.category(),
        }
    }
}

/// A ranked chunk ready for prompt assembly
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedSnippet {
    pub collection_id: String,
    pub file_id: String,
    pub chunk_id: String,
    pub content: String,
    pub distance: f32,
    /// `1 - distance`, in `[0, 1]`
    pub similarity: f32,
    pub title: Option<String>,
    pub kind: Option<SourceKind>,
}

/// Fan-out retrieval across knowledge-base and note collections
pub struct RagAssembler {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    metadata: Arc<dyn MetadataStore>,
    queue: SerialQueue,
    retry: RetryPolicy,
    default_limit: usize,
    max_context_chars: usize,
}

impl RagAssembler {
    pub fn new(
        config: &RagConfig,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        metadata: Arc<dyn MetadataStore>,
        queue: SerialQueue,
    ) -> Self {
        Self {
            embedder,
            index,
            metadata,
            queue,
            retry: config.embedding.retry.clone(),
            default_limit: config.search.default_limit,
            max_context_chars: config.search.max_context_chars,
        }
    }

    /// Embed a query on the serial queue, so it never overlaps ingestion
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>, SearchError> {
        let embedder = self.embedder.clone();
        let retry = self.retry.clone();
        let text = query.to_string();
        let vector = self
            .queue
            .run(JobType::EmbedQuery, async move {
                embed_with_retry(embedder.as_ref(), &text, &retry).await
            })
            .await??;
        Ok(vector)
    }

    /// Top `limit` snippets across `collection_ids`. Missing or failing
    /// collections contribute nothing.
    pub async fn retrieve(
        &self,
        query: &str,
        collection_ids: &[String],
        limit: Option<usize>,
    ) -> Result<Vec<RetrievedSnippet>, SearchError> {
        validate_non_empty(query)?;
        validate_text_size(query, MAX_TEXT_INPUT_BYTES)?;

        let limit = limit.unwrap_or(self.default_limit);
        if collection_ids.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let query_vector = self.embed_query(query).await?;
        let hits = search_many(self.index.as_ref(), collection_ids, &query_vector, limit).await;

        let mut snippets = Vec::with_capacity(hits.len());
        for hit in hits {
            let source = match self.metadata.source_info(&hit.collection_id, &hit.file_id).await {
                Ok(source) => source,
                Err(e) => {
                    tracing::warn!(
                        "Could not resolve source for {}/{}: {}",
                        hit.collection_id,
                        hit.file_id,
                        e
                    );
                    None
                }
            };
            snippets.push(RetrievedSnippet {
                similarity: hit.similarity(),
                collection_id: hit.collection_id,
                file_id: hit.file_id,
                chunk_id: hit.id,
                content: hit.content,
                distance: hit.distance,
                title: source.as_ref().map(|s| s.title.clone()),
                kind: source.map(|s| s.kind),
            });
        }

        tracing::debug!(
            "Retrieved {} snippets from {} collections",
            snippets.len(),
            collection_ids.len()
        );
        Ok(snippets)
    }

    /// Numbered, source-attributed context block of at most `max_context_chars` characters
    pub fn format_context(&self, snippets: &[RetrievedSnippet]) -> String {
        format_context(snippets, self.max_context_chars)
    }
}

/// Render snippets in rank order, stopping at the first one that does not fit.
/// A single oversized first snippet is truncated instead of dropped.
pub fn format_context(snippets: &[RetrievedSnippet], max_chars: usize) -> String {
    let mut out = String::new();
    let mut used = 0;

    for (i, snippet) in snippets.iter().enumerate() {
        let source = snippet
            .title
            .clone()
            .unwrap_or_else(|| snippet.file_id.clone());
        let block = format!(
            "[{}] {} (similarity {:.2})\n{}\n\n",
            i + 1,
            source,
            snippet.similarity,
            snippet.content.trim()
        );
        let len = block.chars().count();

        if used + len > max_chars {
            if i == 0 {
                out.extend(block.chars().take(max_chars));
            }
            break;
        }
        out.push_str(&block);
        used += len;
    }

    out.trim_end().to_string()
}
